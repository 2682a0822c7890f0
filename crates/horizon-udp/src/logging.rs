//! Tracing targets used by the UDP service.
//!
//! The crate never installs a subscriber. Use these targets with `tracing`
//! directives to filter by subsystem:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_udp::event_loop=debug,horizon_udp::multicast=trace")
//!     .init();
//! ```

/// Target names for log filtering.
pub mod targets {
    /// Crate-wide target.
    pub const UDP: &str = "horizon_udp";
    /// Event loop thread: polling, command processing, dispatch.
    pub const EVENT_LOOP: &str = "horizon_udp::event_loop";
    /// Per-socket operations on caller threads.
    pub const SOCKET: &str = "horizon_udp::socket";
    /// Multicast upgrade and reader threads.
    pub const MULTICAST: &str = "horizon_udp::multicast";
    /// Service lifecycle.
    pub const SERVICE: &str = "horizon_udp::service";
}
