use snafu::Snafu;

/// The crate-wide error type. Every fallible operation in the queue core
/// returns `crate::types::Result<T>`, which is `std::result::Result<T, Error>`.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
	/// An error occurred while retrieving or setting values in the store.
	#[snafu(display("Source: {}", source))]
	Db { source: sqlx::Error },

	/// An error occurred while parsing or serializing JSON.
	#[snafu(display("Source: {}", source))]
	Json { source: serde_json::Error },

	/// An error occurred while parsing TOML configuration.
	#[snafu(display("Source: {}", source))]
	Toml { source: toml::de::Error },

	/// An error occurred while sending or receiving an HTTP request.
	#[snafu(display("Source: {}", source))]
	Http { source: reqwest::Error },

	/// The hosting platform responded with a non-success status.
	#[snafu(display("Status code: {}\nBody:\n{:#?}", status, body))]
	Response {
		status: reqwest::StatusCode,
		body: serde_json::Value,
	},

	/// The hosting platform reported a merge conflict (HTTP 409) while
	/// creating the scratch merge commit.
	#[snafu(display("Merge conflict for commit {}", commit_sha))]
	MergeConflict { commit_sha: String },

	/// The hosting platform's reported head SHA for a PR no longer matches
	/// the entity's recorded head SHA; the dispatcher refuses to build a
	/// commit the PR has already moved past.
	#[snafu(display("head SHA moved: expected {}, platform reports {}", expected, actual))]
	StaleHeadSha { expected: String, actual: String },

	/// A request to the session-based CI (buildbot-shape) failed.
	#[snafu(display("CI request failed: {}", msg))]
	CiRequest { msg: String },

	/// Data requested from the hosting platform was missing a field the
	/// core needs (e.g. a PR without a head SHA).
	#[snafu(display("Missing field: {}", field))]
	MissingField { field: String },

	/// The repository configuration did not name exactly one usable CI
	/// block.
	#[snafu(display("Repository {} has no usable CI configuration", repo_label))]
	NoCiConfigured { repo_label: String },

	/// A required environment variable or config key was absent.
	#[snafu(display("Missing configuration: {}", key))]
	MissingConfig { key: String },

	/// Generic message error, used for conditions that don't warrant their
	/// own variant.
	#[snafu(display("Error: {}", msg))]
	Message { msg: String },
}

/// Logs a failed operation and swallows the error, so that one pull
/// request's failure does not halt the queue processor's scan of the rest
/// of the repository.
pub fn log_and_continue<T>(context: &str, result: crate::types::Result<T>) {
	if let Err(err) = result {
		log::error!("{}: {}", context, err);
	}
}
