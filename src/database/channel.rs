use chrono::Utc;
use std::collections::BTreeMap;

use super::{db_error, DbConnection, DbResult};
use crate::schema::enum_def::{ChannelStatus, ChannelType, MultiKeyMode};
use crate::service::cache::types::{CacheChannel, ChannelExtra, ModelRateLimit};
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Identifiable, Debug)]
    #[diesel(table_name = channels)]
    pub struct Channel {
        pub id: i64,
        pub channel_type: i32,
        pub name: String,
        pub base_url: String,
        pub api_keys: String,
        pub status: i32,
        pub priority: i64,
        pub weight: i32,
        pub models: String,
        pub channel_groups: String,
        pub model_mapping: Option<String>,
        pub test_model: Option<String>,
        pub auto_ban: bool,
        pub rate_limit_overrides: Option<String>,
        pub is_multi_key: bool,
        pub multi_key_mode: i32,
        pub tag: Option<String>,
        pub other_info: Option<String>,
        pub used_quota: i64,
        pub response_time: i64,
        pub created_at: i64,
        pub updated_at: i64,
    }
}

pub(crate) fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(raw: Option<&str>, what: &str, id: i64) -> T {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            cyder_tools::log::warn!("channel {} has unreadable {}: {}", id, what, e);
            T::default()
        }),
        None => T::default(),
    }
}

impl Channel {
    pub fn into_cache(self) -> CacheChannel {
        let model_mapping: BTreeMap<String, String> =
            parse_json_column(self.model_mapping.as_deref(), "model_mapping", self.id);
        let rate_limit_overrides: BTreeMap<String, ModelRateLimit> =
            parse_json_column(self.rate_limit_overrides.as_deref(), "rate_limit_overrides", self.id);
        CacheChannel {
            id: self.id,
            channel_type: ChannelType::from_i32(self.channel_type),
            name: self.name,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            keys: split_list(&self.api_keys, '\n'),
            status: ChannelStatus::from_i32(self.status),
            priority: self.priority,
            weight: self.weight.max(0) as u32,
            models: split_list(&self.models, ','),
            groups: split_list(&self.channel_groups, ','),
            model_mapping,
            test_model: self.test_model,
            auto_ban: self.auto_ban,
            rate_limit_overrides,
            is_multi_key: self.is_multi_key,
            multi_key_mode: MultiKeyMode::from_i32(self.multi_key_mode),
            tag: self.tag,
            extra: ChannelExtra::parse(self.other_info.as_deref()),
            used_quota: self.used_quota,
            response_time_ms: self.response_time,
        }
    }

    pub fn from_cache(channel: &CacheChannel) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: channel.id,
            channel_type: channel.channel_type.as_i32(),
            name: channel.name.clone(),
            base_url: channel.base_url.clone(),
            api_keys: channel.keys.join("\n"),
            status: channel.status.as_i32(),
            priority: channel.priority,
            weight: channel.weight as i32,
            models: channel.models.join(","),
            channel_groups: channel.groups.join(","),
            model_mapping: if channel.model_mapping.is_empty() {
                None
            } else {
                serde_json::to_string(&channel.model_mapping).ok()
            },
            test_model: channel.test_model.clone(),
            auto_ban: channel.auto_ban,
            rate_limit_overrides: if channel.rate_limit_overrides.is_empty() {
                None
            } else {
                serde_json::to_string(&channel.rate_limit_overrides).ok()
            },
            is_multi_key: channel.is_multi_key,
            multi_key_mode: channel.multi_key_mode.as_i32(),
            tag: channel.tag.clone(),
            other_info: channel.extra.to_column(),
            used_quota: channel.used_quota,
            response_time: channel.response_time_ms,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn list_all(conn: &mut DbConnection) -> DbResult<Vec<Channel>> {
        db_execute!(conn, {
            let rows = channels::table
                .order(channels::dsl::id.asc())
                .select(ChannelDb::as_select())
                .load::<ChannelDb>(conn)
                .map_err(|e| db_error("Failed to list channels", e))?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }

    pub fn get_by_id(conn: &mut DbConnection, id_value: i64) -> DbResult<Option<Channel>> {
        db_execute!(conn, {
            let row = channels::table
                .find(id_value)
                .select(ChannelDb::as_select())
                .first::<ChannelDb>(conn)
                .optional()
                .map_err(|e| db_error(format!("Error fetching channel {}", id_value), e))?;
            Ok(row.map(|r| r.from_db()))
        })
    }

    pub fn insert(conn: &mut DbConnection, channel: &Channel) -> DbResult<Channel> {
        db_execute!(conn, {
            let row = diesel::insert_into(channels::table)
                .values(ChannelDb::to_db(channel))
                .returning(ChannelDb::as_returning())
                .get_result::<ChannelDb>(conn)
                .map_err(|e| db_error("Failed to create channel", e))?;
            Ok(row.from_db())
        })
    }

    pub fn update_status(
        conn: &mut DbConnection,
        id_value: i64,
        status_value: i32,
        other_info_value: Option<String>,
    ) -> DbResult<usize> {
        let now = Utc::now().timestamp();
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set((
                    channels::dsl::status.eq(status_value),
                    channels::dsl::other_info.eq(other_info_value),
                    channels::dsl::updated_at.eq(now),
                ))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to update status of channel {}", id_value), e))
        })
    }

    pub fn update_other_info(
        conn: &mut DbConnection,
        id_value: i64,
        other_info_value: Option<String>,
    ) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::other_info.eq(other_info_value))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to update other_info of channel {}", id_value), e))
        })
    }

    pub fn update_response_time(conn: &mut DbConnection, id_value: i64, millis: i64) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::response_time.eq(millis))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to update response time of channel {}", id_value), e))
        })
    }

    pub fn add_used_quota(conn: &mut DbConnection, id_value: i64, quota: i64) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(channels::table.find(id_value))
                .set(channels::dsl::used_quota.eq(channels::dsl::used_quota + quota))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to add used quota to channel {}", id_value), e))
        })
    }
}
