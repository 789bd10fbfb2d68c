//! Modbus TCP slave: one listening socket, one served master at a time.
//!
//! The engine accepts a connection, reads MBAP-framed requests, dispatches
//! them against the shared-memory register store and writes back normal or
//! exception responses. Out-of-range accesses never abort the connection;
//! malformed framing does.

use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::frame::{
    encode_adu, Decoded, ExceptionCode, MbapHeader, Request, Response, MBAP_HEADER_LEN,
};
use crate::shutdown::Shutdown;
use crate::store::{AddressError, Bank, RegisterStore};

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_BIND_IP: &str = "0.0.0.0";

/// Listening address and monitor flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    pub bind_ip: String,
    pub port: u16,
    /// Dump every received and sent frame to stdout.
    pub monitor: bool,
}

impl Default for SlaveConfig {
    fn default() -> SlaveConfig {
        SlaveConfig {
            bind_ip: DEFAULT_BIND_IP.to_string(),
            port: DEFAULT_PORT,
            monitor: false,
        }
    }
}

/// Outcome of serving one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Served,
    /// The master closed the connection. Not an error.
    Closed,
}

pub struct Slave {
    listener: TcpListener,
    store: Arc<RegisterStore>,
    shutdown: Shutdown,
    monitor: bool,
}

impl Slave {
    /// Bind and listen. The listener descriptor is registered with the
    /// shutdown token so a pending accept can be unblocked.
    pub fn bind(
        cfg: &SlaveConfig,
        store: Arc<RegisterStore>,
        shutdown: Shutdown,
    ) -> Result<Slave, Error> {
        let listener =
            TcpListener::bind((cfg.bind_ip.as_str(), cfg.port)).map_err(Error::Network)?;
        shutdown.register_listener(listener.as_raw_fd());
        info!(
            "listening on {}",
            listener.local_addr().map_err(Error::Network)?
        );
        Ok(Slave {
            listener,
            store,
            shutdown,
            monitor: cfg.monitor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Error::Network)
    }

    pub fn set_monitor(&mut self, monitor: bool) {
        self.monitor = monitor;
    }

    /// Block until a master connects. Returns `Ok(None)` when the accept
    /// was broken by a requested shutdown instead of a genuine fault.
    pub fn connect_client(&self) -> Result<Option<Connection>, Error> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                self.shutdown.register_client(stream.as_raw_fd());
                // the accept may have raced past the descriptor shutdown;
                // the dropped stream's fd must not stay registered, a later
                // request() could hit a reused fd number
                if self.shutdown.requested() {
                    self.shutdown.clear_client(stream.as_raw_fd());
                    return Ok(None);
                }
                info!("master {} established connection", peer);
                Ok(Some(Connection {
                    stream,
                    peer,
                    store: Arc::clone(&self.store),
                    shutdown: self.shutdown.clone(),
                    monitor: self.monitor,
                }))
            }
            Err(e) if self.shutdown.requested() => {
                debug!("accept unblocked by shutdown: {}", e);
                Ok(None)
            }
            Err(e) => Err(Error::Network(e)),
        }
    }
}

/// One accepted master connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<RegisterStore>,
    shutdown: Shutdown,
    monitor: bool,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read one request frame, dispatch it and send the response.
    ///
    /// A zero-length read on a frame boundary, a connection reset and a
    /// shutdown-unblocked read all report `Closed`; truncated frames are
    /// protocol errors that tear the connection down.
    pub fn handle_request(&mut self) -> Result<RequestOutcome, Error> {
        let mut header_buf = [0u8; MBAP_HEADER_LEN];
        let n = match self.stream.read(&mut header_buf) {
            Ok(0) => return Ok(RequestOutcome::Closed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return Ok(RequestOutcome::Closed)
            }
            Err(e) if self.shutdown.requested() => {
                debug!("read unblocked by shutdown: {}", e);
                return Ok(RequestOutcome::Closed);
            }
            Err(e) => return Err(Error::Network(e)),
        };
        if n < MBAP_HEADER_LEN {
            self.read_frame_bytes(&mut header_buf[n..], "truncated MBAP header")?;
        }

        let header = MbapHeader::decode(&header_buf)?;
        let mut pdu = vec![0u8; header.pdu_len()];
        self.read_frame_bytes(&mut pdu, "truncated request payload")?;

        if self.monitor {
            println!("rx: {}{}", hex(&header_buf), hex(&pdu));
        }

        let response = match Request::decode(&pdu)? {
            Decoded::Request(request) => {
                debug!("request from {}: {:?}", self.peer, request);
                match dispatch(&self.store, &request) {
                    Ok(response) => response,
                    Err(code) => Response::Exception {
                        function: request.function() as u8,
                        code,
                    },
                }
            }
            Decoded::Fault { function, code } => {
                debug!(
                    "unservable request from {} (function 0x{:02X}): {:?}",
                    self.peer, function, code
                );
                Response::Exception { function, code }
            }
        };

        let adu = encode_adu(&header, &response);
        if self.monitor {
            println!("tx: {}", hex(&adu));
        }
        match self.stream.write_all(&adu) {
            Ok(()) => Ok(RequestOutcome::Served),
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                Ok(RequestOutcome::Closed)
            }
            Err(e) => Err(Error::Network(e)),
        }
    }

    /// Fill `buf` from the stream mid-frame. EOF here means the peer went
    /// away inside a frame, which is a framing violation rather than a
    /// clean close.
    fn read_frame_bytes(&mut self, buf: &mut [u8], what: &str) -> Result<(), Error> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::Protocol(what.to_string()))
            }
            Err(e) => Err(Error::Network(e)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.clear_client(self.stream.as_raw_fd());
    }
}

/// Serve one decoded request against the register store.
///
/// An `Err` here is a Modbus exception about to go on the wire, never a
/// process error: address violations are expected outcomes. Write
/// function codes can only express DO and AO targets, which is exactly
/// the master-access policy of the banks.
pub fn dispatch(store: &RegisterStore, request: &Request) -> Result<Response, ExceptionCode> {
    match *request {
        Request::ReadCoils { address, count } => store
            .read_bits(Bank::DiscreteOutput, address, count)
            .map(|values| Response::Bits {
                function: request.function(),
                values,
            })
            .map_err(illegal_address),
        Request::ReadDiscreteInputs { address, count } => store
            .read_bits(Bank::DiscreteInput, address, count)
            .map(|values| Response::Bits {
                function: request.function(),
                values,
            })
            .map_err(illegal_address),
        Request::ReadHoldingRegisters { address, count } => store
            .read_registers(Bank::AnalogOutput, address, count)
            .map(|values| Response::Registers {
                function: request.function(),
                values,
            })
            .map_err(illegal_address),
        Request::ReadInputRegisters { address, count } => store
            .read_registers(Bank::AnalogInput, address, count)
            .map(|values| Response::Registers {
                function: request.function(),
                values,
            })
            .map_err(illegal_address),
        Request::WriteSingleCoil { address, value } => {
            store
                .write_bits(Bank::DiscreteOutput, address, &[value])
                .map_err(illegal_address)?;
            Ok(Response::Echo {
                function: request.function(),
                address,
                value: if value { 0xFF00 } else { 0x0000 },
            })
        }
        Request::WriteSingleRegister { address, value } => {
            store
                .write_registers(Bank::AnalogOutput, address, &[value])
                .map_err(illegal_address)?;
            Ok(Response::Echo {
                function: request.function(),
                address,
                value,
            })
        }
        Request::WriteMultipleCoils {
            address,
            ref values,
        } => {
            store
                .write_bits(Bank::DiscreteOutput, address, values)
                .map_err(illegal_address)?;
            Ok(Response::Echo {
                function: request.function(),
                address,
                value: values.len() as u16,
            })
        }
        Request::WriteMultipleRegisters {
            address,
            ref values,
        } => {
            store
                .write_registers(Bank::AnalogOutput, address, values)
                .map_err(illegal_address)?;
            Ok(Response::Echo {
                function: request.function(),
                address,
                value: values.len() as u16,
            })
        }
        Request::ReadWriteMultipleRegisters {
            read_address,
            read_count,
            write_address,
            ref values,
        } => {
            // write before read (libmodbus order)
            store
                .write_registers(Bank::AnalogOutput, write_address, values)
                .map_err(illegal_address)?;
            store
                .read_registers(Bank::AnalogOutput, read_address, read_count)
                .map(|values| Response::Registers {
                    function: request.function(),
                    values,
                })
                .map_err(illegal_address)
        }
    }
}

fn illegal_address(e: AddressError) -> ExceptionCode {
    debug!("{}", e);
    ExceptionCode::IllegalDataAddress
}

/// libmodbus-style hex dump: one `[xx]` per byte.
fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for b in bytes {
        let _ = write!(out, "[{:02X}]", b);
    }
    out
}
