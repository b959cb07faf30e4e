use super::{db_error, DbConnection, DbResult};
use crate::service::cache::types::CacheModelPrice;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Insertable, Debug)]
    #[diesel(table_name = model_prices)]
    pub struct ModelPrice {
        pub model_name: String,
        pub model_ratio: f64,
        pub completion_ratio: f64,
        pub cache_ratio: f64,
        pub model_price: Option<f64>,
    }
}

impl ModelPrice {
    pub fn into_cache(self) -> CacheModelPrice {
        CacheModelPrice {
            model_name: self.model_name,
            model_ratio: self.model_ratio.max(0.0),
            completion_ratio: self.completion_ratio.max(0.0),
            cache_ratio: self.cache_ratio.max(0.0),
            model_price: self.model_price.filter(|p| *p >= 0.0),
        }
    }

    pub fn list_all(conn: &mut DbConnection) -> DbResult<Vec<ModelPrice>> {
        db_execute!(conn, {
            let rows = model_prices::table
                .order(model_prices::dsl::model_name.asc())
                .select(ModelPriceDb::as_select())
                .load::<ModelPriceDb>(conn)
                .map_err(|e| db_error("Failed to list model prices", e))?;
            Ok(rows.into_iter().map(|row| row.from_db()).collect())
        })
    }

    pub fn upsert(conn: &mut DbConnection, price: &ModelPrice) -> DbResult<usize> {
        db_execute!(conn, {
            diesel::insert_into(model_prices::table)
                .values(ModelPriceDb::to_db(price))
                .on_conflict(model_prices::dsl::model_name)
                .do_update()
                .set((
                    model_prices::dsl::model_ratio.eq(price.model_ratio),
                    model_prices::dsl::completion_ratio.eq(price.completion_ratio),
                    model_prices::dsl::cache_ratio.eq(price.cache_ratio),
                    model_prices::dsl::model_price.eq(price.model_price),
                ))
                .execute(conn)
                .map_err(|e| db_error(format!("Failed to save price for {}", price.model_name), e))
        })
    }
}
