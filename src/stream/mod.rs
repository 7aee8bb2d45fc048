pub use byte_stream::{ByteStream, DEFAULT_MAX_CAPACITY, DEFAULT_MIN_CAPACITY};

mod byte_stream;
