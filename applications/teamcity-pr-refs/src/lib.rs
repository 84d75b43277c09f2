pub mod util {
    /// Escapes a value for use inside a TeamCity service message.
    /// See https://www.jetbrains.com/help/teamcity/service-messages.html#Escaped+Values
    ///
    /// The `|0xNNNN` form for non-ASCII code points is not applied. TeamCity reads service
    /// messages as UTF-8, so such characters are passed through unchanged.
    pub fn teamcity_escape(raw: &str) -> String {
        let mut escaped = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '|' => escaped.push_str("||"),
                '\'' => escaped.push_str("|'"),
                '\n' => escaped.push_str("|n"),
                '\r' => escaped.push_str("|r"),
                '[' => escaped.push_str("|["),
                ']' => escaped.push_str("|]"),
                other => escaped.push(other),
            }
        }
        escaped
    }

    /// Renders a `setParameter` service message line, without the trailing newline.
    pub fn teamcity_set_parameter(name: &str, value: &str) -> String {
        format!(
            "##teamcity[setParameter name='{}' value='{}']",
            teamcity_escape(name),
            teamcity_escape(value)
        )
    }

    /// Reveals only the tail of a secret so it can be told apart in logs.
    pub fn redact(secret: &str) -> String {
        let reveal = std::cmp::min(3, secret.chars().count() / 8);
        let tail: String = secret
            .chars()
            .skip(secret.chars().count() - reveal)
            .collect();

        format!("..{tail}")
    }

}

pub mod business {
    use anyhow::{anyhow, bail, Context, Result};
    use log::{debug, info, trace};
    use reqwest::{header::USER_AGENT, StatusCode};
    use std::{collections::HashMap, fmt, io::Write};

    use super::util::{redact, teamcity_set_parameter};

    pub const REPO_OWNER_ENV_KEY: &str = "GITHUB_REPO_OWNER";
    pub const REPO_NAME_ENV_KEY: &str = "GITHUB_REPO_NAME";
    pub const ACCESS_TOKEN_ENV_KEY: &str = "TEAMCITY_GITHUB_ACCESS_TOKEN";
    /// Optional, points the resolver at a GitHub Enterprise or mock API.
    pub const API_BASE_URL_ENV_KEY: &str = "GITHUB_API_BASE_URL";

    /// Value TeamCity leaves in place of a token parameter that was never filled in.
    pub const UNSET_TOKEN_SENTINEL: &str = "-1";
    pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

    pub const BASE_REF_PARAMETER: &str = "env.GITHUB_PULL_REQUEST_BASE_REF";
    pub const HEAD_REF_PARAMETER: &str = "env.GITHUB_PULL_REQUEST_HEAD_REF";

    /// Snapshot of the environment the resolver reads its configuration from.
    pub struct ResolverEnv(HashMap<String, String>);

    impl ResolverEnv {
        pub fn from_env() -> Self {
            Self::from_iter(std::env::vars())
        }

        // allows looking up variables in the internal map
        pub fn get(&self, var: &str) -> Result<&String> {
            self.0
                .get(var)
                .ok_or_else(|| anyhow!("{var} is not set in the environment"))
        }

        fn get_non_empty(&self, var: &str, what: &str) -> Result<&String> {
            match self.0.get(var) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => bail!("{what} is empty, ensure that {var} env var is set"),
            }
        }

        pub fn try_owner(&self) -> Result<&String> {
            self.get_non_empty(REPO_OWNER_ENV_KEY, "Repository owner")
        }

        pub fn try_repo_name(&self) -> Result<&String> {
            self.get_non_empty(REPO_NAME_ENV_KEY, "Repository name")
        }

        /// The sentinel value is treated like an unset variable.
        pub fn try_access_token(&self) -> Result<&String> {
            let token = self.get_non_empty(ACCESS_TOKEN_ENV_KEY, "Access token")?;
            if token == UNSET_TOKEN_SENTINEL {
                bail!("Access token is empty, ensure that {ACCESS_TOKEN_ENV_KEY} env var is set");
            }

            Ok(token)
        }

        pub fn api_base_url(&self) -> String {
            self.get(API_BASE_URL_ENV_KEY)
                .ok()
                .map(|url| url.trim_end_matches('/'))
                .filter(|url| !url.is_empty())
                .unwrap_or(DEFAULT_API_BASE_URL)
                .to_string()
        }
    }

    impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResolverEnv {
        fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
            Self(
                iter.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            )
        }
    }

    // only the relevant keys, the rest of the environment may hold secrets
    impl fmt::Debug for ResolverEnv {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ResolverEnv")
                .field(REPO_OWNER_ENV_KEY, &self.0.get(REPO_OWNER_ENV_KEY))
                .field(REPO_NAME_ENV_KEY, &self.0.get(REPO_NAME_ENV_KEY))
                .field(
                    ACCESS_TOKEN_ENV_KEY,
                    &self.0.get(ACCESS_TOKEN_ENV_KEY).map(|t| redact(t)),
                )
                .field(API_BASE_URL_ENV_KEY, &self.0.get(API_BASE_URL_ENV_KEY))
                .finish()
        }
    }

    /// Pull request number as it appears in the API path.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PullRequestId(String);

    impl PullRequestId {
        /// Accepts TeamCity branch names such as `123/merge` or `123/head`
        /// and keeps what precedes the first '/'.
        pub fn parse(raw: &str) -> Result<Self> {
            let id = raw.split('/').next().unwrap_or_default();
            if id.is_empty() {
                bail!("couldn't find a pull request id in '{raw}'");
            }

            Ok(Self(id.to_string()))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for PullRequestId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Everything needed to query a single pull request.
    pub struct PullRequestRequest {
        api_base_url: String,
        owner: String,
        repo: String,
        id: PullRequestId,
        access_token: String,
    }

    impl PullRequestRequest {
        /// Validates the configuration in order and fails before any network I/O.
        pub fn from_env(env: &ResolverEnv, raw_id: Option<&str>) -> Result<Self> {
            let owner = env.try_owner()?.clone();
            let repo = env.try_repo_name()?.clone();
            let Some(raw_id) = raw_id else {
                bail!("Pull request id is not set, pass it as the first command-line argument");
            };
            let access_token = env.try_access_token()?.clone();
            let id = PullRequestId::parse(raw_id)?;

            let request = Self {
                api_base_url: env.api_base_url(),
                owner,
                repo,
                id,
                access_token,
            };
            trace!("built request from {env:#?}");

            Ok(request)
        }

        pub fn url(&self) -> String {
            format!(
                "{}/repos/{}/{}/pulls/{}",
                self.api_base_url, self.owner, self.repo, self.id
            )
        }

        /// queries the github API for the base and head branch of this pull request
        pub async fn fetch_refs(&self) -> Result<PullRequestRefs> {
            let url = self.url();
            let req = reqwest::Client::new()
                .get(&url)
                .header("Accept", "application/vnd.github.v3+json")
                .header("Authorization", format!("token {}", self.access_token))
                .header(
                    USER_AGENT,
                    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
                );

            debug!("{url} request: {self:#?}");

            let response = req.send().await.context(format!("querying {url}"))?;

            let status = response.status();
            if status != StatusCode::OK {
                bail!(
                    "Unexpected error code {} when fetching pull request details from {url}",
                    status.as_u16()
                );
            }

            let body = response
                .bytes()
                .await
                .context(format!("reading response body from {url}"))?;
            // strict, regardless of any charset the server announces
            let body = String::from_utf8(body.to_vec())
                .context(format!("decoding response body from {url} as UTF-8"))?;
            let value: serde_json::Value = serde_json::from_str(&body)
                .context(format!("parsing response from {url} as JSON"))?;

            let refs = PullRequestRefs::from_json(&value)?;
            info!(
                "pull request #{} merges '{}' into '{}'",
                self.id, refs.head_ref, refs.base_ref
            );

            Ok(refs)
        }
    }

    impl fmt::Debug for PullRequestRequest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("PullRequestRequest")
                .field("api_base_url", &self.api_base_url)
                .field("owner", &self.owner)
                .field("repo", &self.repo)
                .field("id", &self.id)
                .field("access_token", &redact(&self.access_token))
                .finish()
        }
    }

    /// Base and head branch names of a pull request.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PullRequestRefs {
        pub base_ref: String,
        pub head_ref: String,
    }

    impl PullRequestRefs {
        pub fn from_json(value: &serde_json::Value) -> Result<Self> {
            Ok(Self {
                base_ref: lookup_ref(value, "base")?,
                head_ref: lookup_ref(value, "head")?,
            })
        }

        /// Both service message lines, newline terminated.
        pub fn service_messages(&self) -> String {
            [
                teamcity_set_parameter(BASE_REF_PARAMETER, &self.base_ref),
                teamcity_set_parameter(HEAD_REF_PARAMETER, &self.head_ref),
            ]
            .map(|line| line + "\n")
            .concat()
        }

        /// Writes both lines in one go so a consumer never sees only one of them.
        pub fn export<W: Write>(&self, mut out: W) -> Result<()> {
            out.write_all(self.service_messages().as_bytes())
                .context("writing service messages")?;
            out.flush().context("flushing service messages")?;

            Ok(())
        }
    }

    fn lookup_ref(value: &serde_json::Value, side: &str) -> Result<String> {
        value
            .as_object()
            .and_then(|level0obj| level0obj.get(side))
            .and_then(|level1value| level1value.as_object())
            .and_then(|level1obj| level1obj.get("ref"))
            .and_then(|ref_value| ref_value.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("couldn't find a string at path '.{side}.ref' in the response"))
    }

    /// Builds the request from the environment, fetches the refs and prints them to `out`.
    pub async fn resolve_and_export<W: Write>(
        env: &ResolverEnv,
        raw_id: Option<&str>,
        out: W,
    ) -> Result<PullRequestRefs> {
        let request = PullRequestRequest::from_env(env, raw_id)?;
        let refs = request.fetch_refs().await?;
        refs.export(out)?;

        Ok(refs)
    }

}
