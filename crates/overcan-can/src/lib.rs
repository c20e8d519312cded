mod alert;
mod driver;
mod frame;
mod mem;

pub use alert::BusAlert;
pub use driver::{CanDriver, CanError};
pub use frame::{CAN_MAX_DLEN, CanFrame};
pub use mem::{MemoryBus, MemoryCan};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
