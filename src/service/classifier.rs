use crate::schema::enum_def::ChannelType;
use crate::service::cache::types::DisableKind;

/// Where a failed attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// Upstream answered with a non-2xx status.
    Upstream,
    /// Connect/read failure before a complete response.
    Transport,
    /// Our per-attempt deadline fired.
    Timeout,
    /// 2xx response that is unusable (empty completion, no candidates).
    Sentinel,
    ClientCanceled,
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub origin: FailureOrigin,
    /// 0 when no response status exists.
    pub status: u16,
    pub message: String,
    pub code: Option<String>,
}

impl UpstreamFailure {
    pub fn upstream(status: u16, message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            origin: FailureOrigin::Upstream,
            status,
            message: message.into(),
            code,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Transport,
            status: 0,
            message: message.into(),
            code: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Timeout,
            status: 504,
            message: message.into(),
            code: Some("timeout".to_string()),
        }
    }

    pub fn sentinel(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Sentinel,
            status: 200,
            message: message.into(),
            code: None,
        }
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::Local,
            status: 500,
            message: message.into(),
            code: None,
        }
    }

    pub fn client_canceled() -> Self {
        Self {
            origin: FailureOrigin::ClientCanceled,
            status: 499,
            message: "client closed the connection".to_string(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict {
    pub retry: bool,
    pub disable: Option<DisableKind>,
}

// Lowercase substrings of upstream messages meaning the credential is dead.
const FATAL_SIGNATURES: &[&str] = &[
    "invalid api key",
    "incorrect api key",
    "invalid_api_key",
    "invalid x-api-key",
    "api key not valid",
    "api_key_invalid",
    "api key expired",
    "account deactivated",
    "account has been deactivated",
    "your account is suspended",
    "organization has been disabled",
    "permission denied",
    "the security token included in the request is invalid",
    "access denied",
    "blocked",
];

// Quota signatures that will not clear by waiting a minute.
const QUOTA_SIGNATURES: &[&str] = &[
    "insufficient_quota",
    "exceeded your current quota",
    "credit balance is too low",
    "billing_hard_limit_reached",
    "quota exceeded for quota metric",
    "your prepaid balance",
];

/// Maps a failed attempt to retry / disable decisions.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    keywords: Vec<String>,
}

impl ErrorClassifier {
    /// `keywords` are extra substrings that mark an error disable-worthy.
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, failure: &UpstreamFailure, channel_type: ChannelType) -> Verdict {
        match failure.origin {
            FailureOrigin::ClientCanceled | FailureOrigin::Local => Verdict::default(),
            FailureOrigin::Sentinel | FailureOrigin::Transport | FailureOrigin::Timeout => Verdict {
                retry: true,
                disable: None,
            },
            FailureOrigin::Upstream => Verdict {
                retry: should_retry_status(failure.status, channel_type),
                disable: self.disable_kind(failure),
            },
        }
    }

    fn disable_kind(&self, failure: &UpstreamFailure) -> Option<DisableKind> {
        let status = failure.status;
        if (200..300).contains(&status) {
            return None;
        }
        let text = match &failure.code {
            Some(code) => format!("{} {}", failure.message, code).to_lowercase(),
            None => failure.message.to_lowercase(),
        };
        let matches = |list: &[&str]| list.iter().any(|sig| text.contains(sig));

        if status == 429 {
            return matches(QUOTA_SIGNATURES).then_some(DisableKind::Throttle);
        }
        if matches!(status, 408 | 504 | 524) {
            return None;
        }
        if matches!(status, 401 | 403) && (matches(FATAL_SIGNATURES) || matches(QUOTA_SIGNATURES)) {
            return Some(DisableKind::Fatal);
        }
        if self.keywords.iter().any(|k| text.contains(k.as_str())) {
            return Some(DisableKind::Fatal);
        }
        None
    }
}

fn should_retry_status(status: u16, channel_type: ChannelType) -> bool {
    match status {
        200..=299 => false,
        400 => channel_type == ChannelType::Anthropic,
        408 | 504 | 524 => false,
        307 | 429 => true,
        500..=599 => true,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, message: &str, channel_type: ChannelType) -> Verdict {
        ErrorClassifier::new(&[]).classify(&UpstreamFailure::upstream(status, message, None), channel_type)
    }

    #[test]
    fn test_status_table() {
        let openai = ChannelType::OpenAI;
        assert_eq!(classify(200, "", openai), Verdict { retry: false, disable: None });
        assert_eq!(classify(500, "boom", openai), Verdict { retry: true, disable: None });
        assert_eq!(classify(502, "bad gateway", openai), Verdict { retry: true, disable: None });
        assert_eq!(classify(429, "slow down", openai), Verdict { retry: true, disable: None });
        assert_eq!(classify(307, "", openai), Verdict { retry: true, disable: None });
        for timeout in [408, 504, 524] {
            assert_eq!(classify(timeout, "timeout", openai), Verdict { retry: false, disable: None });
        }
    }

    #[test]
    fn test_bad_request_is_retried_only_for_anthropic() {
        assert!(!classify(400, "bad", ChannelType::OpenAI).retry);
        assert!(classify(400, "overloaded", ChannelType::Anthropic).retry);
    }

    #[test]
    fn test_invalid_key_disables() {
        let verdict = classify(401, "Incorrect API key provided: sk-****", ChannelType::OpenAI);
        assert_eq!(verdict.disable, Some(DisableKind::Fatal));
        let verdict = classify(401, "invalid api key", ChannelType::OpenAI);
        assert_eq!(verdict.disable, Some(DisableKind::Fatal));
        assert_eq!(classify(401, "try later", ChannelType::OpenAI).disable, None);
    }

    #[test]
    fn test_permanent_quota_on_429_is_throttle() {
        let verdict = classify(429, "You exceeded your current quota, please check your plan", ChannelType::OpenAI);
        assert_eq!(verdict, Verdict { retry: true, disable: Some(DisableKind::Throttle) });
    }

    #[test]
    fn test_configured_keywords() {
        let classifier = ErrorClassifier::new(&["  Model Deprecated ".to_string()]);
        let failure = UpstreamFailure::upstream(404, "model deprecated for this org", None);
        assert_eq!(classifier.classify(&failure, ChannelType::OpenAI).disable, Some(DisableKind::Fatal));
    }

    #[test]
    fn test_local_origins() {
        let classifier = ErrorClassifier::default();
        let openai = ChannelType::OpenAI;
        assert_eq!(classifier.classify(&UpstreamFailure::client_canceled(), openai), Verdict::default());
        assert_eq!(classifier.classify(&UpstreamFailure::local("encode"), openai), Verdict::default());
        assert!(classifier.classify(&UpstreamFailure::timeout("deadline"), openai).retry);
        assert!(classifier.classify(&UpstreamFailure::sentinel("empty completion tokens"), openai).retry);
    }
}
