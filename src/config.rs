use serde::Deserialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{self, Error};
use crate::types::Result;

/// The CI shape a repository is wired to. Only one of these should be
/// configured per repository; the dispatcher picks its branch name and
/// builder set based on which variant is present, per §4.4.1.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiKind {
	/// Session-based CI with a buildbot-style login/stopselected/rebuild
	/// API; the dispatcher owns the single build slot for these builders
	/// and can cheaply rebuild a prior attempt instead of a fresh merge.
	#[serde(rename = "buildbot")]
	Session {
		builders: Vec<String>,
		#[serde(default)]
		try_builders: Vec<String>,
	},
	/// Single-report CI: exactly one status context, `travis`.
	Travis,
	/// Single-report CI: exactly one status context, `status`.
	Status,
	/// Per-builder status-only CI, one `merge-test/<builder>` context
	/// each; branch is `merge_bot_<baseRef>` rather than a shared `auto`.
	#[serde(rename = "testrunners")]
	TestRunners { builders: Vec<String> },
}

impl CiKind {
	/// True for the session-CI shape, which shares the process-wide
	/// build slot and supports the rebuild fast path.
	pub fn is_session(&self) -> bool {
		matches!(self, CiKind::Session { .. })
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BranchNames {
	#[serde(rename = "try")]
	pub try_: Option<String>,
	pub auto: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
	pub owner: String,
	pub repo: String,
	pub reviewers: Vec<String>,
	pub ci: CiKind,
	#[serde(default, rename = "branch")]
	pub branch_names: BranchNames,
}

impl RepoConfig {
	/// The scratch branch a fresh build is pushed to, honoring the
	/// `branch.try`/`branch.auto` name remaps from config.
	pub fn scratch_branch(&self, try_mode: bool, base_ref: &str) -> String {
		match &self.ci {
			CiKind::TestRunners { .. } => format!("merge_bot_{}", base_ref),
			_ if try_mode => self.branch_names.try_.clone().unwrap_or_else(|| "try".to_string()),
			_ => self.branch_names.auto.clone().unwrap_or_else(|| "auto".to_string()),
		}
	}

	/// The builder set a fresh build is dispatched against.
	pub fn builders(&self, try_mode: bool) -> Vec<String> {
		match &self.ci {
			CiKind::Session { builders, try_builders } => {
				if try_mode && !try_builders.is_empty() {
					try_builders.clone()
				} else {
					builders.clone()
				}
			}
			CiKind::Travis => vec!["travis".to_string()],
			CiKind::Status => vec!["status".to_string()],
			CiKind::TestRunners { builders } => builders.clone(),
		}
	}
}

/// The `[github]` config block; `access_token` may also be supplied via the
/// `GITHUB_TOKEN` environment variable, which takes precedence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubConfig {
	pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub bot_username: String,
	pub listen_addr: String,
	pub webhook_secret: String,
	#[serde(default)]
	pub github: GithubConfig,
	pub repos: Vec<RepoConfig>,
}

impl Config {
	/// Loads configuration from `cfg.toml`, falling back to `cfg.json` if
	/// the TOML file isn't present, then layers environment overrides on
	/// top via `dotenv`. Matches the original's `toml.loads(...)` with a
	/// `json.loads(...)` fallback in its startup sequence.
	pub fn load() -> Result<Self> {
		dotenv::dotenv().ok();

		let raw = if Path::new("cfg.toml").exists() {
			std::fs::read_to_string("cfg.toml")
		} else {
			std::fs::read_to_string("cfg.json")
		};
		let raw = raw.map_err(|_| Error::MissingConfig {
			key: "cfg.toml or cfg.json".to_string(),
		})?;

		let mut config: Self = if raw.trim_start().starts_with('{') {
			serde_json::from_str(&raw).context(error::Json)?
		} else {
			toml::from_str(&raw).context(error::Toml)?
		};

		if let Ok(bot_username) = dotenv::var("BOT_USERNAME") {
			config.bot_username = bot_username;
		}
		if let Ok(listen_addr) = dotenv::var("LISTEN_ADDR") {
			config.listen_addr = listen_addr;
		}
		if let Ok(webhook_secret) = dotenv::var("WEBHOOK_SECRET") {
			config.webhook_secret = webhook_secret;
		}

		Ok(config)
	}

	pub fn repo(&self, owner: &str, repo: &str) -> Option<&RepoConfig> {
		self.repos
			.iter()
			.find(|r| r.owner == owner && r.repo == repo)
	}

	pub fn repos_by_label(&self) -> HashMap<String, &RepoConfig> {
		self.repos
			.iter()
			.map(|r| (format!("{}/{}", r.owner, r.repo), r))
			.collect()
	}
}
