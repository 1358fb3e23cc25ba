use crate::errors::PoolError;

pub type PoolResult<T> = Result<T, PoolError>;
