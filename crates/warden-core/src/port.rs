use std::{io, net::TcpListener};

/// Source of TCP ports that are free at the moment of the query.
///
/// Nothing is reserved: another process may take the port before the plugin
/// binds it.
pub trait PortAllocator {
    fn allocate(&self) -> io::Result<u16>;
}

/// Asks the OS for an ephemeral port on the loopback interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralPorts;

impl PortAllocator for EphemeralPorts {
    fn allocate(&self) -> io::Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

impl<A: PortAllocator + ?Sized> PortAllocator for &A {
    fn allocate(&self) -> io::Result<u16> {
        (**self).allocate()
    }
}
