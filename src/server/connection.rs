use mio::net::TcpStream;

#[derive(Debug, PartialEq)]
pub enum ConnectionState {
    ReadRequest,
    WriteResponse,
}

/// One accepted client socket with its buffers. Owned exclusively by the
/// event loop; removal from the connection table closes the socket.
pub struct Connection {
    pub stream: TcpStream,
    pub state: ConnectionState,
    pub read_buffer: Vec<u8>,
    pub write_buffer: Vec<u8>,
    pub bytes_written: usize,
    /// Port of the listener this connection arrived on; the resolver keys
    /// virtual-host lookup off it.
    pub port: u16,
}

impl Connection {
    pub fn new(stream: TcpStream, port: u16) -> Self {
        Self {
            stream,
            state: ConnectionState::ReadRequest,
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::new(),
            bytes_written: 0,
            port,
        }
    }
}
