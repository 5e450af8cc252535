pub mod acceptor;
pub mod connection;
pub mod http1;
pub mod splice;
pub mod upstream;
