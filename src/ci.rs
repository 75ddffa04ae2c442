use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;

use crate::error::{self, Error};
use crate::types::Result;

/// Report shape for CI systems that never receive calls from the
/// dispatcher (Travis, generic status checks, test runners): the
/// dispatcher only reads these back via `GithubClient::get_commit_statuses`,
/// it never dispatches a build directly. This type exists purely to name
/// the interface in configuration and logs.
#[derive(Debug, Clone)]
pub struct StatelessCiReport {
	pub context: String,
	pub state: crate::github::GithubCommitStatusState,
}

/// Buildbot-shape session CI: the dispatcher logs in once, forces a build
/// against the scratch-merge branch, and can request a rebuild of a
/// previous session by sourcestamp. Grounded on the original's
/// `buildbot_sess` context manager and the teacher's bearer-auth HTTP
/// client conventions.
#[async_trait]
pub trait SessionCiClient: Send + Sync {
	/// Authenticates and returns an opaque session token to pass to the
	/// other methods.
	async fn login(&self) -> Result<String>;

	/// Requests a rebuild of a previous build by POSTing back to that
	/// build's own URL (which already identifies the source stamp to
	/// reuse), rather than addressing the builder generically.
	async fn rebuild(&self, session: &str, builder: &str, build_url: &str) -> Result<()>;

	/// Cancels any pending build across `builders`.
	async fn stop_selected(&self, session: &str, builders: &[String]) -> Result<()>;

	/// Releases a session acquired by `login`. Callers must call this on
	/// every exit path once logged in, successful or not, per the
	/// login/logout acquisition scope.
	async fn logout(&self, session: &str) -> Result<()>;
}

pub struct HttpSessionCiClient {
	client: reqwest::Client,
	base_url: String,
	username: String,
	password: String,
}

impl HttpSessionCiClient {
	pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into(),
			username: username.into(),
			password: password.into(),
		}
	}
}

#[async_trait]
impl SessionCiClient for HttpSessionCiClient {
	async fn login(&self) -> Result<String> {
		#[derive(Deserialize)]
		struct LoginResponse {
			session: String,
		}
		let response = self
			.client
			.post(format!("{}/login", self.base_url))
			.form(&[("username", self.username.as_str()), ("passwd", self.password.as_str())])
			.send()
			.await
			.context(error::Http)?;
		if !response.status().is_success() {
			return Err(Error::CiRequest {
				msg: format!("login failed with status {}", response.status()),
			});
		}
		Ok(response
			.json::<LoginResponse>()
			.await
			.context(error::Http)?
			.session)
	}

	async fn rebuild(&self, session: &str, builder: &str, build_url: &str) -> Result<()> {
		let response = self
			.client
			.post(format!("{}/rebuild", build_url))
			.query(&[("session", session)])
			.form(&[("useSourcestamp", "exact"), ("comments", "Initiated by the merge queue")])
			.send()
			.await
			.context(error::Http)?;
		let text = response.text().await.context(error::Http)?;
		check_session_response(&text, builder)
	}

	async fn stop_selected(&self, session: &str, builders: &[String]) -> Result<()> {
		let response = self
			.client
			.post(format!("{}/builders/_selected/stopselected", self.base_url))
			.query(&[("session", session)])
			.form(&[
				("selected", builders.join(",")),
				(
					"comments",
					format!(
						"{} ({})",
						crate::constants::INTERRUPTED_COMMENT_PREFIX,
						chrono::Utc::now().timestamp()
					),
				),
			])
			.send()
			.await
			.context(error::Http)?;
		if !response.status().is_success() {
			return Err(Error::CiRequest {
				msg: format!("stopselected failed with status {}", response.status()),
			});
		}
		Ok(())
	}

	async fn logout(&self, session: &str) -> Result<()> {
		self.client
			.get(format!("{}/logout", self.base_url))
			.query(&[("session", session)])
			.send()
			.await
			.context(error::Http)?;
		Ok(())
	}
}

/// Interprets a buildbot-shape HTTP response body the way the dispatcher's
/// rebuild path has to: an `authzfail` substring means the session wasn't
/// authorized, and a response that never mentions the builder name at all
/// is an unknown error whose message is pulled (best effort) from the
/// response's `<title>` tag.
fn check_session_response(body: &str, builder: &str) -> Result<()> {
	if body.contains("authzfail") {
		return Err(Error::CiRequest {
			msg: "authorization failed".to_string(),
		});
	}
	if !body.contains(builder) {
		let title = body
			.find("<title>")
			.and_then(|start| body[start + 7..].find("</title>").map(|end| &body[start + 7..start + 7 + end]));
		return Err(Error::CiRequest {
			msg: title.unwrap_or("unknown error").trim().to_string(),
		});
	}
	Ok(())
}
