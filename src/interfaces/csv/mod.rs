pub mod charge_writer;
pub mod request_reader;
