mod scheduler;
mod sync;
