//! nixpkgs-review entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nixpkgs_review::cli::{Cli, Command, apply_pr_flags, pr_numbers};
use nixpkgs_review::config::Config;
use nixpkgs_review::errors::{EXIT_FAILURE, EXIT_SUCCESS, EXIT_USAGE, Error};
use nixpkgs_review::github::GithubClient;
use nixpkgs_review::process::install_sigint_handler;
use nixpkgs_review::review::Review;
use nixpkgs_review::types::PrNumber;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nixpkgs_review=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders its own message; keep its exit code for
            // --help/--version, usage errors exit 2.
            let _ = err.print();
            std::process::exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };

    install_sigint_handler();

    let code = match run(cli).await {
        Ok(success) => {
            if success {
                EXIT_SUCCESS
            } else {
                EXIT_FAILURE
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<bool, Error> {
    match cli.command {
        Command::Pr {
            numbers,
            eval,
            checkout,
            post_result,
            approve,
            merge,
            common,
        } => {
            let mut config = common.to_config()?;
            apply_pr_flags(&mut config, &eval, &checkout, post_result, approve, merge)?;
            let review = Review::new(config)?;
            let mut success = true;
            // Multiple PRs run serially; each launches its shell in turn.
            for pr in pr_numbers(&numbers) {
                let summary = review.run_pr(pr).await?;
                success &= summary.success;
            }
            Ok(success)
        }
        Command::Rev { commit, common } => {
            let config = common.to_config()?;
            let review = Review::new(config)?;
            Ok(review.run_rev(&commit).await?.success)
        }
        Command::Wip { staged, common } => {
            let config = common.to_config()?;
            let review = Review::new(config)?;
            Ok(review.run_wip(staged).await?.success)
        }
        Command::Approve { number } => {
            let client = standalone_client()?;
            client
                .approve_pr(PrNumber(number), "")
                .await?;
            Ok(true)
        }
        Command::Merge { number } => {
            let client = standalone_client()?;
            client.merge_pr(PrNumber(number)).await?;
            Ok(true)
        }
        Command::PostResult { number } => {
            let client = standalone_client()?;
            let report = find_report(number)?;
            client.comment_issue(PrNumber(number), &report).await?;
            Ok(true)
        }
        Command::Comments { number } => {
            let client = standalone_client()?;
            for comment in client.comments(PrNumber(number)).await? {
                println!("--- {} ({})", comment.user.login, comment.created_at);
                println!("{}\n", comment.body);
            }
            Ok(true)
        }
    }
}

fn standalone_client() -> Result<GithubClient, Error> {
    let mut config = Config::default();
    config.resolve_token()?;
    Ok(GithubClient::new(config.token.as_deref())?)
}

/// The markdown report of the most recent review of this PR.
fn find_report(number: u64) -> Result<String, Error> {
    let root = nixpkgs_review::config::cache_root()?;
    let dir = root.join(format!("pr-{number}"));
    let path = dir.join("report.md");
    std::fs::read_to_string(&path).map_err(|_| {
        Error::Usage(format!(
            "no report found at {}; run `nixpkgs-review pr {number}` first",
            path.display()
        ))
    })
}
