use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ci::SessionCiClient;
use crate::config::Config;
use crate::github::GithubClient;
use crate::store::Store;

/// Holds the single in-flight scratch build's merge-commit SHA. Only one
/// session-CI build may be outstanding at a time process-wide; the
/// dispatcher checks and fills this before creating a scratch merge and
/// clears it if the attempt fails before CI is dispatched.
pub type BuildSlot = Mutex<Option<String>>;

/// Everything the queue core needs to act: storage, the hosting-platform
/// client, an optional session-CI client (repositories wired to a
/// stateless CI never populate this), and the loaded configuration. Held
/// behind an `Arc` and cloned into every background task.
pub struct AppState {
	pub store: Store,
	pub gh_client: Arc<dyn GithubClient>,
	pub ci_client: Option<Arc<dyn SessionCiClient>>,
	pub config: Config,

	/// Serializes every scheduling decision: only one task may be deciding
	/// what to build or merge next at a time. Async-aware because the
	/// dispatcher performs `.await`ed hosting-platform and CI calls while
	/// holding it.
	pub queue_handler_lock: Mutex<()>,
	pub build_slot: BuildSlot,
}

impl AppState {
	pub fn new(
		store: Store,
		gh_client: Arc<dyn GithubClient>,
		ci_client: Option<Arc<dyn SessionCiClient>>,
		config: Config,
	) -> Self {
		Self {
			store,
			gh_client,
			ci_client,
			config,
			queue_handler_lock: Mutex::new(()),
			build_slot: Mutex::new(None),
		}
	}
}
