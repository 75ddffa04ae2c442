use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use merge_queue_bot::ci::HttpSessionCiClient;
use merge_queue_bot::config::{CiKind, Config};
use merge_queue_bot::core::AppState;
use merge_queue_bot::github::HttpGithubClient;
use merge_queue_bot::logging;
use merge_queue_bot::prober::run_prober;
use merge_queue_bot::queue::process_all_queues;
use merge_queue_bot::store::Store;
use merge_queue_bot::sync::synchronize_repo;
use merge_queue_bot::webhook::run_server;

#[derive(Parser, Debug)]
#[clap(name = "merge-queue-bot")]
struct Args {
	/// Enables debug-level logging regardless of RUST_LOG.
	#[clap(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let mut builder = env_logger::Builder::from_default_env();
	builder.format(logging::gke::format);
	if args.verbose {
		builder.filter_level(log::LevelFilter::Debug);
	}
	builder.init();

	let config = Config::load()?;

	let db_path = dotenv::var("DB_PATH").unwrap_or_else(|_| "queue.db".to_string());
	let store = Store::connect(&db_path).await?;

	let github_token = dotenv::var("GITHUB_TOKEN")
		.ok()
		.or_else(|| config.github.access_token.clone())
		.ok_or_else(|| merge_queue_bot::Error::MissingConfig {
			key: "GITHUB_TOKEN or github.access_token".to_string(),
		})?;
	let gh_client = Arc::new(HttpGithubClient::new(github_token));

	let ci_client = if let Ok(ci_base_url) = dotenv::var("CI_BASE_URL") {
		let ci_user = dotenv::var("CI_USERNAME").unwrap_or_default();
		let ci_password = dotenv::var("CI_PASSWORD").unwrap_or_default();
		Some(Arc::new(HttpSessionCiClient::new(ci_base_url, ci_user, ci_password)) as Arc<_>)
	} else {
		None
	};

	let repos_with_session_ci = config
		.repos
		.iter()
		.any(|r| matches!(r.ci, CiKind::Session { .. }));
	if repos_with_session_ci && ci_client.is_none() {
		log::warn!("repositories configured with session CI, but CI_BASE_URL is unset");
	}

	let listen_addr: std::net::SocketAddr = config.listen_addr.parse()?;
	let state = Arc::new(AppState::new(store, gh_client, ci_client, config));

	match state.gh_client.rate_limit_status().await {
		Ok(status) if status.remaining < 50 => {
			let now = chrono::Utc::now().timestamp();
			let wait = (status.reset_at - now).max(0) as u64;
			log::warn!(
				"rate limit nearly exhausted ({} remaining), sleeping {}s until reset before startup sync",
				status.remaining,
				wait
			);
			tokio::time::sleep(Duration::from_secs(wait)).await;
		}
		Ok(_) => {}
		Err(err) => log::warn!("could not check rate limit at startup: {}", err),
	}

	for repo_cfg in &state.config.repos {
		if let Err(err) = synchronize_repo(&state, repo_cfg).await {
			log::error!("startup synchronize of {}/{} failed: {}", repo_cfg.owner, repo_cfg.repo, err);
		}
	}

	let server_state = state.clone();
	let server_task = tokio::spawn(async move {
		if let Err(err) = run_server(server_state, listen_addr).await {
			log::error!("webhook server exited: {}", err);
		}
	});

	let prober_state = state.clone();
	let prober_task = tokio::spawn(async move {
		run_prober(&prober_state, Duration::from_secs(60)).await;
	});

	let queue_state = state.clone();
	let queue_task = tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(30));
		loop {
			interval.tick().await;
			if let Err(err) = process_all_queues(&queue_state).await {
				log::error!("queue processing pass failed: {}", err);
			}
		}
	});

	let _ = tokio::join!(server_task, prober_task, queue_task);

	Ok(())
}
