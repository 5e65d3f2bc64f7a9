pub mod address;
pub mod channel;
pub mod comm_queue;
pub mod connection;
pub mod connection_manager;
pub mod global_channel;
pub mod manager_config;
pub mod packet_header;
pub mod private_channel;
pub mod response_time;
pub mod timing;
