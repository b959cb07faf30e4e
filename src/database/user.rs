use chrono::Utc;

use super::{db_error, DbConnection, DbResult};
use crate::schema::enum_def::{UserRole, UserStatus};
use crate::service::cache::types::CacheUser;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Identifiable, Debug)]
    #[diesel(table_name = users)]
    pub struct User {
        pub id: i64,
        pub username: String,
        pub role: i32,
        pub status: i32,
        pub user_group: String,
        pub quota: i64,
        pub used_quota: i64,
        pub request_count: i64,
        pub inviter_id: Option<i64>,
        pub created_at: i64,
    }
}

impl User {
    pub fn into_cache(self) -> CacheUser {
        CacheUser {
            id: self.id,
            username: self.username,
            role: UserRole::from_i32(self.role),
            status: UserStatus::from_i32(self.status),
            group: self.user_group,
            quota: self.quota,
            used_quota: self.used_quota,
        }
    }

    pub fn from_cache(user: &CacheUser) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role.as_i32(),
            status: user.status.as_i32(),
            user_group: user.group.clone(),
            quota: user.quota,
            used_quota: user.used_quota,
            request_count: 0,
            inviter_id: None,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn get_by_id(conn: &mut DbConnection, id_value: i64) -> DbResult<Option<User>> {
        db_execute!(conn, {
            let row = users::table
                .find(id_value)
                .select(UserDb::as_select())
                .first::<UserDb>(conn)
                .optional()
                .map_err(|e| db_error(format!("Error fetching user {}", id_value), e))?;
            Ok(row.map(|r| r.from_db()))
        })
    }

    pub fn insert(conn: &mut DbConnection, user: &User) -> DbResult<User> {
        db_execute!(conn, {
            let row = diesel::insert_into(users::table)
                .values(UserDb::to_db(user))
                .returning(UserDb::as_returning())
                .get_result::<UserDb>(conn)
                .map_err(|e| db_error("Failed to create user", e))?;
            Ok(row.from_db())
        })
    }

    /// Conditional debit of the user's balance.
    pub fn decrease_quota_checked(conn: &mut DbConnection, id_value: i64, amount: i64) -> DbResult<bool> {
        db_execute!(conn, {
            let affected = diesel::update(
                users::table
                    .filter(users::dsl::id.eq(id_value))
                    .filter(users::dsl::quota.ge(amount)),
            )
            .set(users::dsl::quota.eq(users::dsl::quota - amount))
            .execute(conn)
            .map_err(|e| db_error(format!("Failed to debit user {}", id_value), e))?;
            Ok(affected == 1)
        })
    }

    pub fn adjust_quota(conn: &mut DbConnection, id_value: i64, delta: i64) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(users::table.find(id_value))
                .set(users::dsl::quota.eq(users::dsl::quota - delta))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to adjust quota of user {}", id_value), e))
        })
    }

    pub fn add_used_quota(conn: &mut DbConnection, id_value: i64, quota_value: i64) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::update(users::table.find(id_value))
                .set((
                    users::dsl::used_quota.eq(users::dsl::used_quota + quota_value),
                    users::dsl::request_count.eq(users::dsl::request_count + 1),
                ))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to add used quota to user {}", id_value), e))
        })
    }
}
