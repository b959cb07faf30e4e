use super::{db_error, DbConnection, DbResult};
use crate::service::cache::types::CacheGroup;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Debug)]
    #[diesel(table_name = user_groups)]
    pub struct UserGroup {
        pub name: String,
        pub ratio: f64,
        pub description: String,
        pub usable: bool,
    }
}

impl UserGroup {
    pub fn into_cache(self) -> CacheGroup {
        CacheGroup {
            name: self.name,
            ratio: self.ratio.max(0.0),
            description: self.description,
            usable: self.usable,
        }
    }

    pub fn list_all(conn: &mut DbConnection) -> DbResult<Vec<UserGroup>> {
        db_execute!(conn, {
            let rows = user_groups::table
                .order(user_groups::dsl::name.asc())
                .select(UserGroupDb::as_select())
                .load::<UserGroupDb>(conn)
                .map_err(|e| db_error("Failed to list groups", e))?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }

    /// Inserts or replaces the ratio row for a group.
    pub fn upsert(conn: &mut DbConnection, group: &UserGroup) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::insert_into(user_groups::table)
                .values(UserGroupDb::to_db(group))
                .on_conflict(user_groups::dsl::name)
                .do_update()
                .set((
                    user_groups::dsl::ratio.eq(group.ratio),
                    user_groups::dsl::description.eq(group.description.clone()),
                    user_groups::dsl::usable.eq(group.usable),
                ))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to save group {}", group.name), e))
        })
    }
}
