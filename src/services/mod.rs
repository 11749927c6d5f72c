pub mod batch;
pub mod lease;
pub mod ocr;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
