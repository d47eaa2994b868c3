mod concurrency;
mod fs_store;
mod session;
