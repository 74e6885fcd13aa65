mod lock;
mod purge;
