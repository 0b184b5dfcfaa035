pub mod crc;
pub mod frame;
