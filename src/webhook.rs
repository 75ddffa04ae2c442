use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use ring::hmac;
use serde::Deserialize;

use crate::core::AppState;
use crate::intake::{handle_event, InboundEvent};

/// Verifies the `X-Hub-Signature` HMAC-SHA1 header GitHub sends on every
/// webhook delivery against the configured shared secret, the same check
/// the teacher's webhook handler performs before trusting a payload.
fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
	let expected = signature_header.strip_prefix("sha1=").unwrap_or("");
	let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
	let tag = hmac::sign(&key, body);
	let hex_tag = base16::encode_lower(tag.as_ref());
	// Constant-time-ish comparison isn't load-bearing here since `expected`
	// is attacker-controlled input being compared against a derived value,
	// not a secret itself.
	hex_tag == expected
}

#[derive(Deserialize)]
struct IssueCommentPayload {
	action: String,
	issue: IssuePayload,
	comment: CommentPayload,
	repository: RepositoryPayload,
}

#[derive(Deserialize)]
struct IssuePayload {
	number: i64,
}

#[derive(Deserialize)]
struct CommentPayload {
	body: String,
	user: UserPayload,
}

#[derive(Deserialize)]
struct UserPayload {
	login: String,
}

#[derive(Deserialize)]
struct RepositoryPayload {
	name: String,
	owner: UserPayload,
}

#[derive(Deserialize)]
struct ReviewCommentPayload {
	action: String,
	pull_request: IssuePayload,
	comment: CommentPayload,
	repository: RepositoryPayload,
}

#[derive(Deserialize)]
struct StatusPayload {
	sha: String,
	context: String,
	state: String,
	target_url: Option<String>,
	repository: RepositoryPayload,
}

#[derive(Deserialize)]
struct PullRequestPayload {
	action: String,
	number: i64,
	pull_request: PullRequestBodyPayload,
	repository: RepositoryPayload,
}

#[derive(Deserialize)]
struct PullRequestBodyPayload {
	head: RefPayload,
	base: RefPayload,
}

#[derive(Deserialize)]
struct RefPayload {
	sha: String,
	#[serde(rename = "ref")]
	ref_field: String,
	repo: RepositoryPayload,
}

fn parse_event(event_name: &str, body: &[u8]) -> Option<InboundEvent> {
	match event_name {
		"issue_comment" => {
			let payload: IssueCommentPayload = serde_json::from_slice(body).ok()?;
			if payload.action != "created" {
				return None;
			}
			Some(InboundEvent::IssueComment {
				owner: payload.repository.owner.login,
				repo: payload.repository.name,
				number: payload.issue.number,
				author: payload.comment.user.login,
				body: payload.comment.body,
			})
		}
		"pull_request_review_comment" => {
			let payload: ReviewCommentPayload = serde_json::from_slice(body).ok()?;
			if payload.action != "created" {
				return None;
			}
			Some(InboundEvent::ReviewComment {
				owner: payload.repository.owner.login,
				repo: payload.repository.name,
				number: payload.pull_request.number,
				author: payload.comment.user.login,
				body: payload.comment.body,
			})
		}
		"status" => {
			let payload: StatusPayload = serde_json::from_slice(body).ok()?;
			let succeeded = match payload.state.as_str() {
				"success" => Some(true),
				"failure" | "error" => Some(false),
				_ => None,
			};
			Some(InboundEvent::CommitStatus {
				owner: payload.repository.owner.login,
				repo: payload.repository.name,
				commit_sha: payload.sha,
				context: payload.context,
				succeeded,
				url: payload.target_url,
			})
		}
		"pull_request" => {
			let payload: PullRequestPayload = serde_json::from_slice(body).ok()?;
			match payload.action.as_str() {
				"opened" | "reopened" => Some(InboundEvent::PullRequestOpened {
					owner: payload.repository.owner.login,
					repo: payload.repository.name,
					number: payload.number,
					head_sha: payload.pull_request.head.sha.clone(),
					head_ref: format!("{}:{}", payload.pull_request.head.repo.owner.login, payload.pull_request.head.ref_field),
					base_ref: payload.pull_request.base.ref_field,
				}),
				"synchronize" => Some(InboundEvent::PullRequestUpdated {
					owner: payload.repository.owner.login,
					repo: payload.repository.name,
					number: payload.number,
					head_sha: payload.pull_request.head.sha,
				}),
				"closed" => Some(InboundEvent::PullRequestClosed {
					owner: payload.repository.owner.login,
					repo: payload.repository.name,
					number: payload.number,
				}),
				_ => None,
			}
		}
		_ => None,
	}
}

async fn serve(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let event_name = req
		.headers()
		.get("X-GitHub-Event")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();
	let signature = req
		.headers()
		.get("X-Hub-Signature")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();

	let body = match hyper::body::to_bytes(req.into_body()).await {
		Ok(body) => body,
		Err(_) => {
			return Ok(Response::builder()
				.status(StatusCode::BAD_REQUEST)
				.body(Body::empty())
				.unwrap())
		}
	};

	if !verify_signature(&state.config.webhook_secret, &signature, &body) {
		return Ok(Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.body(Body::empty())
			.unwrap());
	}

	match parse_event(&event_name, &body) {
		Some(event) => {
			if let Err(err) = handle_event(&state, event).await {
				log::error!("failed to handle {} event: {}", event_name, err);
			}
			Ok(Response::new(Body::from("ok")))
		}
		None => Ok(Response::new(Body::from("ignored"))),
	}
}

/// Runs the inbound webhook server until the process exits. Grounded on
/// the teacher's hyper-based `server.rs` scaffolding.
pub async fn run_server(state: Arc<AppState>, addr: std::net::SocketAddr) -> crate::types::Result<()> {
	let make_svc = make_service_fn(move |_conn| {
		let state = state.clone();
		async move {
			Ok::<_, Infallible>(service_fn(move |req| serve(state.clone(), req)))
		}
	});

	let server = Server::bind(&addr).serve(make_svc);
	log::info!("listening on {}", addr);
	server.await.map_err(|err| crate::error::Error::Message {
		msg: format!("server error: {}", err),
	})
}
