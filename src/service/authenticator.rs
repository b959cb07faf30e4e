use cyder_tools::log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use super::cache::types::{CacheToken, CacheUser};
use super::entity_cache::EntityCache;
use super::pricing::PriceTable;
use super::registry::AUTO_GROUP;
use super::store::{Store, StoreError};
use crate::schema::enum_def::{TokenStatus, UserStatus};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no api key provided")]
    MissingKey,
    #[error("invalid api key")]
    InvalidKey,
    #[error("api key is disabled")]
    TokenDisabled,
    #[error("api key has expired")]
    TokenExpired,
    #[error("api key quota is exhausted")]
    TokenExhausted,
    #[error("ip {0} is not allowed for this api key")]
    IpNotAllowed(String),
    #[error("user is disabled")]
    UserDisabled,
    #[error("group {0} is not available to this user")]
    GroupNotAllowed(String),
    #[error("model {0} is not allowed for this api key")]
    ModelNotAllowed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The authenticated caller, bound into every downstream step.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: Arc<CacheUser>,
    pub token: Arc<CacheToken>,
    /// Group the request is billed and routed under. May be `auto`.
    pub using_group: String,
    pub pinned_channel_id: Option<i64>,
}

impl AuthContext {
    pub fn token_model_limits(&self) -> Option<&[String]> {
        self.token.model_limits_enabled.then_some(self.token.model_limits.as_slice())
    }

    pub fn check_model(&self, model: &str) -> Result<(), AuthError> {
        match self.token_model_limits() {
            Some(allowed) if !allowed.iter().any(|m| m == model) => {
                Err(AuthError::ModelNotAllowed(model.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Splits `key-<channel_id>` into the key and the pin.
fn split_pin(key: &str) -> Option<(&str, i64)> {
    let (head, tail) = key.rsplit_once('-')?;
    if head.is_empty() {
        return None;
    }
    tail.parse::<i64>().ok().map(|id| (head, id))
}

fn ip_allowed(allow_ips: &[String], ip: Option<IpAddr>) -> bool {
    let allowed: Vec<&str> = allow_ips.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if allowed.is_empty() {
        return true;
    }
    let Some(ip) = ip else {
        return false;
    };
    allowed.iter().any(|entry| entry.parse::<IpAddr>().is_ok_and(|a| a == ip))
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    cache: EntityCache,
    prices: Arc<PriceTable>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, cache: EntityCache, prices: Arc<PriceTable>) -> Self {
        Self { store, cache, prices }
    }

    async fn lookup(&self, raw: &str) -> Result<(Arc<CacheToken>, Option<i64>), AuthError> {
        if let Some((key, channel_id)) = split_pin(raw) {
            if let Some(token) = self.cache.token_by_key(self.store.as_ref(), key).await? {
                return Ok((token, Some(channel_id)));
            }
        }
        match self.cache.token_by_key(self.store.as_ref(), raw).await? {
            Some(token) => Ok((token, None)),
            None => Err(AuthError::InvalidKey),
        }
    }

    /// `raw_key` has had any `Bearer ` / `sk-` prefix removed already.
    pub async fn authenticate(&self, raw_key: &str, client_ip: Option<IpAddr>, now_secs: i64) -> Result<AuthContext, AuthError> {
        if raw_key.trim().is_empty() {
            return Err(AuthError::MissingKey);
        }
        let (token, pin) = self.lookup(raw_key.trim()).await?;

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => return Err(AuthError::TokenDisabled),
            TokenStatus::Expired => return Err(AuthError::TokenExpired),
            TokenStatus::Exhausted => return Err(AuthError::TokenExhausted),
        }

        if !ip_allowed(&token.allow_ips, client_ip) {
            let ip = client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string());
            warn!("token {} used from disallowed ip {}", token.id, ip);
            return Err(AuthError::IpNotAllowed(ip));
        }

        let user = self
            .cache
            .user_by_id(self.store.as_ref(), token.user_id)
            .await?
            .ok_or(AuthError::InvalidKey)?;
        if user.status != UserStatus::Enabled {
            return Err(AuthError::UserDisabled);
        }

        let using_group = match token.group.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
            Some(group) => {
                let known = group == AUTO_GROUP || self.prices.group_exists(group);
                if !known || !self.prices.is_usable_by(group, &user.group) {
                    return Err(AuthError::GroupNotAllowed(group.to_string()));
                }
                group.to_string()
            }
            None => user.group.clone(),
        };

        if token.is_expired_at(now_secs) {
            self.transition(&token, TokenStatus::Expired).await;
            return Err(AuthError::TokenExpired);
        }
        if token.is_exhausted() {
            self.transition(&token, TokenStatus::Exhausted).await;
            return Err(AuthError::TokenExhausted);
        }

        let pinned_channel_id = match pin {
            Some(id) if user.role.is_admin() => {
                debug!("admin {} pinned channel {}", user.id, id);
                Some(id)
            }
            Some(id) => {
                warn!("ignoring channel pin {} from non-admin user {}", id, user.id);
                None
            }
            None => None,
        };

        Ok(AuthContext {
            user,
            token,
            using_group,
            pinned_channel_id,
        })
    }

    async fn transition(&self, token: &CacheToken, status: TokenStatus) {
        info!("token {} -> {}", token.id, status);
        if let Err(e) = self.store.update_token_status(token.id, status).await {
            warn!("failed to persist status of token {}: {}", token.id, e);
        }
        self.cache.invalidate_token(&token.key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::schema::enum_def::UserRole;
    use crate::service::cache::types::CacheGroup;
    use crate::service::store::MemoryStore;

    async fn setup(token: CacheToken, user: CacheUser) -> (Arc<MemoryStore>, Authenticator) {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(&user).await.unwrap();
        store.insert_token(&token).await.unwrap();
        let prices = Arc::new(PriceTable::new(
            vec![
                CacheGroup { name: "g_default".into(), ratio: 1.0, description: String::new(), usable: true },
                CacheGroup { name: "hidden".into(), ratio: 1.0, description: String::new(), usable: false },
            ],
            vec![],
        ));
        let cache = EntityCache::new(&CacheConfig::default(), "salt", None);
        let auth = Authenticator::new(store.clone(), cache, prices);
        (store, auth)
    }

    fn token() -> CacheToken {
        CacheToken {
            id: 10,
            user_id: 1,
            key: "TKEY".into(),
            name: "t".into(),
            remaining_quota: 100,
            expired_time: -1,
            ..Default::default()
        }
    }

    fn user(role: UserRole) -> CacheUser {
        CacheUser {
            id: 1,
            username: "u1".into(),
            role,
            group: "g_default".into(),
            quota: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_valid_key_binds_context() {
        let (_, auth) = setup(token(), user(UserRole::Common)).await;
        let ctx = auth.authenticate("TKEY", None, 0).await.unwrap();
        assert_eq!(ctx.user.id, 1);
        assert_eq!(ctx.token.id, 10);
        assert_eq!(ctx.using_group, "g_default");
        assert_eq!(ctx.pinned_channel_id, None);
        assert!(matches!(auth.authenticate("nope", None, 0).await, Err(AuthError::InvalidKey)));
        assert!(matches!(auth.authenticate("", None, 0).await, Err(AuthError::MissingKey)));
    }

    #[tokio::test]
    async fn test_channel_pin_only_for_admins() {
        let (_, auth) = setup(token(), user(UserRole::Admin)).await;
        assert_eq!(auth.authenticate("TKEY-42", None, 0).await.unwrap().pinned_channel_id, Some(42));

        let (_, auth) = setup(token(), user(UserRole::Common)).await;
        assert_eq!(auth.authenticate("TKEY-42", None, 0).await.unwrap().pinned_channel_id, None);
    }

    #[tokio::test]
    async fn test_ip_allow_list() {
        let mut t = token();
        t.allow_ips = vec!["10.0.0.1".into()];
        let (_, auth) = setup(t, user(UserRole::Common)).await;
        let allowed: IpAddr = "10.0.0.1".parse().unwrap();
        let denied: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(auth.authenticate("TKEY", Some(allowed), 0).await.is_ok());
        assert!(matches!(auth.authenticate("TKEY", Some(denied), 0).await, Err(AuthError::IpNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_disabled_user_rejected() {
        let mut u = user(UserRole::Common);
        u.status = UserStatus::Disabled;
        let (_, auth) = setup(token(), u).await;
        assert!(matches!(auth.authenticate("TKEY", None, 0).await, Err(AuthError::UserDisabled)));
    }

    #[tokio::test]
    async fn test_token_group_must_be_usable() {
        let mut t = token();
        t.group = Some("hidden".into());
        let (_, auth) = setup(t, user(UserRole::Common)).await;
        assert!(matches!(auth.authenticate("TKEY", None, 0).await, Err(AuthError::GroupNotAllowed(_))));

        let mut t = token();
        t.group = Some("auto".into());
        let (_, auth) = setup(t, user(UserRole::Common)).await;
        assert_eq!(auth.authenticate("TKEY", None, 0).await.unwrap().using_group, "auto");
    }

    #[tokio::test]
    async fn test_lazy_expiry_and_exhaustion() {
        let mut t = token();
        t.expired_time = 100;
        let (store, auth) = setup(t, user(UserRole::Common)).await;
        assert!(auth.authenticate("TKEY", None, 100).await.is_ok());
        assert!(matches!(auth.authenticate("TKEY", None, 101).await, Err(AuthError::TokenExpired)));
        assert_eq!(store.get_token(10).await.unwrap().unwrap().status, TokenStatus::Expired);
        // the cached entry was dropped, so the stored status is seen next time
        assert!(matches!(auth.authenticate("TKEY", None, 0).await, Err(AuthError::TokenExpired)));

        let mut t = token();
        t.remaining_quota = 0;
        let (store, auth) = setup(t, user(UserRole::Common)).await;
        assert!(matches!(auth.authenticate("TKEY", None, 0).await, Err(AuthError::TokenExhausted)));
        assert_eq!(store.get_token(10).await.unwrap().unwrap().status, TokenStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_unlimited_token_never_exhausts() {
        let mut t = token();
        t.remaining_quota = 0;
        t.unlimited_quota = true;
        let (_, auth) = setup(t, user(UserRole::Common)).await;
        assert!(auth.authenticate("TKEY", None, i64::MAX).await.is_ok());
    }

    #[test]
    fn test_model_limits() {
        let mut t = token();
        t.model_limits_enabled = true;
        t.model_limits = vec!["m".into()];
        let ctx = AuthContext {
            user: Arc::new(user(UserRole::Common)),
            token: Arc::new(t),
            using_group: "g_default".into(),
            pinned_channel_id: None,
        };
        assert!(ctx.check_model("m").is_ok());
        assert!(matches!(ctx.check_model("x"), Err(AuthError::ModelNotAllowed(_))));
    }

    #[test]
    fn test_split_pin() {
        assert_eq!(split_pin("abc-12"), Some(("abc", 12)));
        assert_eq!(split_pin("abc-def"), None);
        assert_eq!(split_pin("-12"), None);
    }
}
