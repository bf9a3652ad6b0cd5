//! Generic read access for any table-backed entity.

use std::marker::PhantomData;

use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::filter::{Column, Filter, FilterValue};
use crate::PersistenceError;

pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static {
    type Column: Column;

    const TABLE: &'static str;
    /// Unique natural key used by [`PgRepository::get`].
    const KEY: Self::Column;
    const COLUMNS: &'static [Self::Column];
    const ORDER_BY: &'static str;
}

pub struct PgRepository<E> {
    pool: PgPool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for PgRepository<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> PgRepository<E> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn select(filter: &Filter<E::Column>) -> QueryBuilder<'static, Postgres> {
        let columns = E::COLUMNS
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ");
        let mut qb = QueryBuilder::new(format!("SELECT {columns} FROM {}", E::TABLE));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY ");
        qb.push(E::ORDER_BY);
        qb
    }

    pub async fn get(&self, key: impl Into<FilterValue>) -> Result<Option<E>, PersistenceError> {
        self.get_one(&Filter::new().eq(E::KEY, key)).await
    }

    pub async fn get_one(&self, filter: &Filter<E::Column>) -> Result<Option<E>, PersistenceError> {
        let mut qb = Self::select(filter);
        qb.push(" LIMIT 1");
        Ok(qb.build_query_as::<E>().fetch_optional(&self.pool).await?)
    }

    pub async fn get_list(&self, filter: &Filter<E::Column>) -> Result<Vec<E>, PersistenceError> {
        let mut qb = Self::select(filter);
        Ok(qb.build_query_as::<E>().fetch_all(&self.pool).await?)
    }
}
