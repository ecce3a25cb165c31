/*
Aliases for data types for readability and to allow resizing in future
*/

pub type ChannelId = u64; // Never reused within the lifetime of a process
pub type PortNumber = u16; // Conforms to TCP/IP port numbering
pub type ByteCount = usize; // Sizes and offsets within a byte stream
