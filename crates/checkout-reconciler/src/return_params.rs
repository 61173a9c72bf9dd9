//! Query parameters the provider appends when redirecting back.

use serde::Serialize;
use url::Url;

/// Purchase context carried by a return redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReturnParams {
    pub session_id: Option<String>,
    pub plan_id: Option<String>,
    pub app_id: Option<String>,
}

impl ReturnParams {
    /// Parse a full return URL or a bare query string (`?session_id=...`).
    /// Unknown keys and empty values are ignored.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match Url::parse(input) {
            Ok(url) => Self::from_pairs(url.query_pairs()),
            Err(_) => {
                let query = input.split_once('?').map_or(input, |(_, query)| query);
                Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
            }
        }
    }

    fn from_pairs<'a>(
        pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
    ) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "session_id" => params.session_id = Some(value.to_string()),
                "plan" | "plan_id" => params.plan_id = Some(value.to_string()),
                "app" | "app_id" => params.app_id = Some(value.to_string()),
                _ => {}
            }
        }
        params
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Default::default()
        }
    }

    pub fn app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.plan_id.is_none() && self.app_id.is_none()
    }
}
