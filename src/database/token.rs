use chrono::Utc;

use super::channel::split_list;
use super::{db_error, DbConnection, DbResult};
use crate::schema::enum_def::TokenStatus;
use crate::service::cache::types::CacheToken;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Identifiable, Debug)]
    #[diesel(table_name = tokens)]
    pub struct Token {
        pub id: i64,
        pub user_id: i64,
        pub key: String,
        pub name: String,
        pub status: i32,
        pub remaining_quota: i64,
        pub used_quota: i64,
        pub unlimited_quota: bool,
        pub expired_time: i64,
        pub model_limits_enabled: bool,
        pub model_limits: String,
        pub allow_ips: String,
        pub token_group: Option<String>,
        pub created_at: i64,
        pub accessed_at: i64,
    }
}

impl Token {
    pub fn into_cache(self) -> CacheToken {
        CacheToken {
            id: self.id,
            user_id: self.user_id,
            key: self.key,
            name: self.name,
            status: TokenStatus::from_i32(self.status),
            remaining_quota: self.remaining_quota,
            unlimited_quota: self.unlimited_quota,
            expired_time: self.expired_time,
            model_limits_enabled: self.model_limits_enabled,
            model_limits: split_list(&self.model_limits, ','),
            allow_ips: self
                .allow_ips
                .split(|c| c == ',' || c == '\n')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            group: self.token_group.filter(|g| !g.trim().is_empty()),
        }
    }

    pub fn from_cache(token: &CacheToken) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: token.id,
            user_id: token.user_id,
            key: token.key.clone(),
            name: token.name.clone(),
            status: token.status.as_i32(),
            remaining_quota: token.remaining_quota,
            used_quota: 0,
            unlimited_quota: token.unlimited_quota,
            expired_time: token.expired_time,
            model_limits_enabled: token.model_limits_enabled,
            model_limits: token.model_limits.join(","),
            allow_ips: token.allow_ips.join(","),
            token_group: token.group.clone(),
            created_at: now,
            accessed_at: 0,
        }
    }

    pub fn get_by_key(conn: &mut DbConnection, key_value: &str) -> DbResult<Option<Token>> {
        db_execute!(conn, {
            let row = tokens::table
                .filter(tokens::dsl::key.eq(key_value))
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .optional()
                .map_err(|e| db_error("Error fetching token by key", e))?;
            Ok(row.map(|r| r.from_db()))
        })
    }

    pub fn get_by_id(conn: &mut DbConnection, id_value: i64) -> DbResult<Option<Token>> {
        db_execute!(conn, {
            let row = tokens::table
                .find(id_value)
                .select(TokenDb::as_select())
                .first::<TokenDb>(conn)
                .optional()
                .map_err(|e| db_error(format!("Error fetching token {}", id_value), e))?;
            Ok(row.map(|r| r.from_db()))
        })
    }

    pub fn insert(conn: &mut DbConnection, token: &Token) -> DbResult<Token> {
        db_execute!(conn, {
            let row = diesel::insert_into(tokens::table)
                .values(TokenDb::to_db(token))
                .returning(TokenDb::as_returning())
                .get_result::<TokenDb>(conn)
                .map_err(|e| db_error("Failed to create token", e))?;
            Ok(row.from_db())
        })
    }

    pub fn update_status(conn: &mut DbConnection, id_value: i64, status_value: i32) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(tokens::table.find(id_value))
                .set(tokens::dsl::status.eq(status_value))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to update status of token {}", id_value), e))
        })
    }

    /// Conditional debit: succeeds only while `remaining_quota >= amount`.
    pub fn decrease_quota_checked(conn: &mut DbConnection, id_value: i64, amount: i64) -> DbResult<bool> {
        let now = Utc::now().timestamp();
        db_execute!(conn, {
            let affected = diesel::update(
                tokens::table
                    .filter(tokens::dsl::id.eq(id_value))
                    .filter(tokens::dsl::remaining_quota.ge(amount)),
            )
            .set((
                tokens::dsl::remaining_quota.eq(tokens::dsl::remaining_quota - amount),
                tokens::dsl::used_quota.eq(tokens::dsl::used_quota + amount),
                tokens::dsl::accessed_at.eq(now),
            ))
            .execute(conn)
            .map_err(|e| db_error(format!("Failed to debit token {}", id_value), e))?;
            Ok(affected == 1)
        })
    }

    /// Unconditional adjustment; a negative `delta` credits the token back.
    pub fn adjust_quota(conn: &mut DbConnection, id_value: i64, delta: i64) -> DbResult<usize> {
        let now = Utc::now().timestamp();
        db_execute!(conn, {
            diesel::update(tokens::table.find(id_value))
                .set((
                    tokens::dsl::remaining_quota.eq(tokens::dsl::remaining_quota - delta),
                    tokens::dsl::used_quota.eq(tokens::dsl::used_quota + delta),
                    tokens::dsl::accessed_at.eq(now),
                ))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to adjust quota of token {}", id_value), e))
        })
    }
}
