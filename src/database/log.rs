use super::{db_error, DbConnection, DbResult};
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Identifiable, Debug)]
    #[diesel(table_name = logs)]
    pub struct ConsumeLog {
        pub id: i64,
        pub log_type: i32,
        pub request_id: String,
        pub user_id: i64,
        pub token_id: i64,
        pub token_name: String,
        pub channel_id: Option<i64>,
        pub model_name: String,
        pub prompt_tokens: i64,
        pub completion_tokens: i64,
        pub quota: i64,
        pub latency_ms: i64,
        pub is_stream: bool,
        pub group_used: String,
        pub content: String,
        pub other: String,
        pub created_at: i64,
    }
}

impl ConsumeLog {
    pub fn insert(conn: &mut DbConnection, log: &ConsumeLog) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::insert_into(logs::table)
                .values(ConsumeLogDb::to_db(log))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to insert log for request {}", log.request_id), e))
        })
    }

    pub fn list_by_user(conn: &mut DbConnection, user_id_value: i64, limit: i64) -> DbResult<Vec<ConsumeLog>> {
        db_execute!(conn, {
            let rows = logs::table
                .filter(logs::dsl::user_id.eq(user_id_value))
                .order((logs::dsl::created_at.desc(), logs::dsl::id.desc()))
                .limit(limit)
                .select(ConsumeLogDb::as_select())
                .load::<ConsumeLogDb>(conn)
                .map_err(|e| db_error(format!("Failed to list logs of user {}", user_id_value), e))?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }
}
