pub mod commander;
pub mod syslog;

pub use commander::{NcpTransport, NullNcpCommander, SerialNcpCommander};
pub use syslog::{NcpEvent, SyslogReceiver};
