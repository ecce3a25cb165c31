/*
Blocking sockets driven by one dedicated thread per connection, plus the listener
that hands inbound connections to a notification sink.
*/
pub mod connection;
pub mod listener;
pub mod transport;

mod connection_thread;

use std::time::Duration;

const MAX_TX_RETRY_COUNT: usize = 5;
const TX_RETRY_INTERVAL: Duration = Duration::from_millis(10);
