/// Resolves the base and head branch of a GitHub pull request and hands them to TeamCity
/// as `env.GITHUB_PULL_REQUEST_BASE_REF` and `env.GITHUB_PULL_REQUEST_HEAD_REF`.
///
/// Usage: teamcity-pr-refs <pull_request_id>[/merge]
///
/// Reads GITHUB_REPO_OWNER, GITHUB_REPO_NAME and TEAMCITY_GITHUB_ACCESS_TOKEN from the environment.
/// Logs go to stderr, stdout only carries the service messages.
use std::process::ExitCode;

use log::error;

use teamcity_pr_refs::business::{self, ResolverEnv};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let env = ResolverEnv::from_env();
    let raw_id = std::env::args().nth(1);

    match business::resolve_and_export(&env, raw_id.as_deref(), std::io::stdout().lock()).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            // TeamCity shows stdout in the build log, keep the message there
            println!("exception: {e:#}");
            ExitCode::FAILURE
        }
    }
}
