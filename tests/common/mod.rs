//! Shared fixture: an app with inline jobs and direct store access, plus
//! a thin request helper driving the real router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use gatehouse::api;
use gatehouse::authz::AccessLevel;
use gatehouse::config::Config;
use gatehouse::models::group::{Group, Plan, SeatControl, Subscription, Visibility};
use gatehouse::models::member::{Member, MembershipSource, MemberState};
use gatehouse::models::token::TokenScope;
use gatehouse::models::user::{User, UserKind};
use gatehouse::AppState;

pub struct TestApp {
    pub state: Arc<AppState>,
    router: Router,
}

pub fn app() -> TestApp {
    let config = Config {
        inline_jobs: true,
        ..Default::default()
    };
    let state = AppState::new(config).expect("state builds");
    TestApp::with_state(state)
}

impl TestApp {
    pub fn with_state(state: Arc<AppState>) -> TestApp {
        let router = api::router(state.clone());
        TestApp { state, router }
    }

    /// A user plus a usable api token (admins also get `admin_mode`).
    pub fn user(&self, username: &str, admin: bool) -> (User, String) {
        let user = self.state.store.create_user(
            username,
            username,
            &format!("{}@example.com", username),
            admin,
            UserKind::Human,
        );
        let mut scopes = vec![TokenScope::Api];
        if admin {
            scopes.push(TokenScope::AdminMode);
        }
        let (raw, _) = self.state.store.create_token(user.id, "test", scopes, None);
        (user, raw)
    }

    pub fn group(&self, path: &str, visibility: Visibility) -> Group {
        self.state
            .store
            .create_group(path, path, visibility, None, None)
    }

    /// Top-level group with a paid subscription and seat blocking on.
    pub fn saas_group(&self, path: &str, plan: Plan, seats: u32) -> Group {
        let group = self.state.store.create_group(
            path,
            path,
            Visibility::Private,
            None,
            Some(Subscription { plan, seats }),
        );
        self.state
            .store
            .update_group(group.id, |g| {
                g.settings.seat_control = SeatControl::BlockOverages
            })
            .expect("group exists")
    }

    pub fn add_member(&self, user: &User, source: MembershipSource, level: AccessLevel) {
        self.state.store.add_member(Member {
            user_id: user.id,
            source,
            access_level: level,
            member_role_id: None,
            state: MemberState::Active,
            expires_at: None,
            created_at: Utc::now(),
        });
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request builds"),
            None => builder.body(Body::empty()).expect("request builds"),
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body reads")
            .to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, json)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, HeaderMap, Value) {
        self.request("GET", path, token, None).await
    }
}

/// Pulls the opaque cursor out of a keyset `Link` header.
pub fn cursor_from_link(headers: &HeaderMap) -> String {
    let link = headers
        .get("link")
        .expect("Link header present")
        .to_str()
        .expect("Link header is ascii");
    let start = link.find("cursor=").expect("cursor param present") + "cursor=".len();
    let rest = &link[start..];
    let end = rest
        .find(|c| c == '&' || c == '>')
        .unwrap_or(rest.len());
    urlencoding::decode(&rest[..end])
        .expect("cursor decodes")
        .into_owned()
}
