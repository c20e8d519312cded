bitflags::bitflags! {
    /// Controller alert conditions a [CanDriver](crate::CanDriver) can report
    ///
    /// The alert set a driver reports is configurable at runtime, so a supervisor can narrow its
    /// subscription while waiting out a recovery sequence.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BusAlert: u32 {
        /// TX/RX error counters rose above the warning level
        const ABOVE_ERR_WARN = 1 << 0;
        /// TX/RX error counters dropped back below the warning level
        const BELOW_ERR_WARN = 1 << 1;
        /// Controller entered the error-passive state
        const ERR_PASSIVE = 1 << 2;
        /// Controller returned to the error-active state
        const ERR_ACTIVE = 1 << 3;
        /// Controller entered bus-off after excessive TX errors
        const BUS_OFF = 1 << 4;
        /// Bus-off recovery completed (128 bus-free sequences observed)
        const BUS_RECOVERED = 1 << 5;
    }
}
