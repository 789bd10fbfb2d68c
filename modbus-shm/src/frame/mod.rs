//! Modbus TCP framing: MBAP header plus PDU codec.
//!
//! Every ADU is a 7-byte MBAP header (transaction id, protocol id = 0,
//! length, unit id) followed by a PDU (function code + payload). Responses
//! mirror transaction id and unit id; exception responses set the high bit
//! of the function code and append a one-byte exception code.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::errors::Error;

pub const MBAP_HEADER_LEN: usize = 7;
/// Maximum PDU size, inherited from the RS485 ADU limit of 256 bytes.
pub const MAX_PDU_LEN: usize = 253;
/// The MBAP length field counts the unit id plus the PDU.
pub const MAX_LENGTH_FIELD: usize = MAX_PDU_LEN + 1;

/// Per-function quantity ceilings from the Modbus specification, enforced
/// before any register bank is touched.
pub const MAX_READ_BITS: u16 = 0x07D0;
pub const MAX_READ_REGISTERS: u16 = 0x007D;
pub const MAX_WRITE_BITS: u16 = 0x07B0;
pub const MAX_WRITE_REGISTERS: u16 = 0x007B;
pub const MAX_RW_READ_REGISTERS: u16 = 0x007D;
pub const MAX_RW_WRITE_REGISTERS: u16 = 0x0079;

/// Function codes this slave implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadWriteMultipleRegisters = 0x17,
}

/// Modbus exception codes used by this slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Number of bytes following the length field: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(buf: &[u8; MBAP_HEADER_LEN]) -> Result<MbapHeader, Error> {
        let header = MbapHeader {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };
        if header.protocol_id != 0 {
            return Err(Error::Protocol(format!(
                "unsupported protocol id {}",
                header.protocol_id
            )));
        }
        // at least unit id + function code, at most unit id + full PDU
        if header.length < 2 || header.length as usize > MAX_LENGTH_FIELD {
            return Err(Error::Protocol(format!(
                "invalid length field {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// Bytes of the PDU following this header.
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// A request this slave knows how to serve. Quantity ceilings and fixed
/// payload values (coil on/off) are already validated at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    ReadInputRegisters { address: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: Vec<u16>,
    },
}

/// Decode outcome. A frame can be well-formed at the framing level and
/// still not be servable; such frames are answered with an exception
/// instead of tearing the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Request(Request),
    /// Answered with an exception response without touching the store:
    /// unknown function byte (IllegalFunction) or an out-of-spec quantity
    /// or payload value (IllegalDataValue).
    Fault { function: u8, code: ExceptionCode },
}

fn truncated(_: std::io::Error) -> Error {
    Error::Protocol("truncated request payload".to_string())
}

impl Request {
    /// Decode one request PDU.
    ///
    /// Framing violations (empty or truncated PDU, trailing bytes) are
    /// `Error::Protocol`; the stream cannot be trusted past them even
    /// though the MBAP length kept us in sync.
    pub fn decode(pdu: &[u8]) -> Result<Decoded, Error> {
        let (&function, body) = pdu
            .split_first()
            .ok_or_else(|| Error::Protocol("empty PDU".to_string()))?;
        let fault = |code| Ok(Decoded::Fault { function, code });
        let mut c = Cursor::new(body);

        let request = match function {
            0x01..=0x04 => {
                let address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let count = c.read_u16::<BigEndian>().map_err(truncated)?;
                let max = if function <= 0x02 {
                    MAX_READ_BITS
                } else {
                    MAX_READ_REGISTERS
                };
                if count == 0 || count > max {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                match function {
                    0x01 => Request::ReadCoils { address, count },
                    0x02 => Request::ReadDiscreteInputs { address, count },
                    0x03 => Request::ReadHoldingRegisters { address, count },
                    _ => Request::ReadInputRegisters { address, count },
                }
            }
            0x05 => {
                let address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let raw = c.read_u16::<BigEndian>().map_err(truncated)?;
                let value = match raw {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return fault(ExceptionCode::IllegalDataValue),
                };
                Request::WriteSingleCoil { address, value }
            }
            0x06 => {
                let address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let value = c.read_u16::<BigEndian>().map_err(truncated)?;
                Request::WriteSingleRegister { address, value }
            }
            0x0F => {
                let address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let count = c.read_u16::<BigEndian>().map_err(truncated)?;
                let byte_count = c.read_u8().map_err(truncated)?;
                if count == 0 || count > MAX_WRITE_BITS {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                if byte_count as usize != (count as usize + 7) / 8 {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                let mut bytes = vec![0u8; byte_count as usize];
                c.read_exact(&mut bytes).map_err(truncated)?;
                Request::WriteMultipleCoils {
                    address,
                    values: unpack_bits(&bytes, count as usize),
                }
            }
            0x10 => {
                let address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let count = c.read_u16::<BigEndian>().map_err(truncated)?;
                let byte_count = c.read_u8().map_err(truncated)?;
                if count == 0 || count > MAX_WRITE_REGISTERS {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                if byte_count as usize != count as usize * 2 {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(c.read_u16::<BigEndian>().map_err(truncated)?);
                }
                Request::WriteMultipleRegisters { address, values }
            }
            0x17 => {
                let read_address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let read_count = c.read_u16::<BigEndian>().map_err(truncated)?;
                let write_address = c.read_u16::<BigEndian>().map_err(truncated)?;
                let write_count = c.read_u16::<BigEndian>().map_err(truncated)?;
                let byte_count = c.read_u8().map_err(truncated)?;
                if read_count == 0
                    || read_count > MAX_RW_READ_REGISTERS
                    || write_count == 0
                    || write_count > MAX_RW_WRITE_REGISTERS
                {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                if byte_count as usize != write_count as usize * 2 {
                    return fault(ExceptionCode::IllegalDataValue);
                }
                let mut values = Vec::with_capacity(write_count as usize);
                for _ in 0..write_count {
                    values.push(c.read_u16::<BigEndian>().map_err(truncated)?);
                }
                Request::ReadWriteMultipleRegisters {
                    read_address,
                    read_count,
                    write_address,
                    values,
                }
            }
            _ => return fault(ExceptionCode::IllegalFunction),
        };

        if c.position() as usize != body.len() {
            return Err(Error::Protocol("request length mismatch".to_string()));
        }
        Ok(Decoded::Request(request))
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Request::ReadWriteMultipleRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters,
        }
    }
}

/// A response PDU about to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC 01/02: byte count, packed bits.
    Bits {
        function: FunctionCode,
        values: Vec<bool>,
    },
    /// FC 03/04/17: byte count, big-endian words.
    Registers {
        function: FunctionCode,
        values: Vec<u16>,
    },
    /// FC 05/06/0F/10 echo: address plus value (or quantity written).
    Echo {
        function: FunctionCode,
        address: u16,
        value: u16,
    },
    Exception {
        function: u8,
        code: ExceptionCode,
    },
}

impl Response {
    pub fn encode_pdu(&self, out: &mut Vec<u8>) {
        match self {
            Response::Bits { function, values } => {
                let packed = pack_bits(values);
                out.push(*function as u8);
                out.push(packed.len() as u8);
                out.extend_from_slice(&packed);
            }
            Response::Registers { function, values } => {
                out.push(*function as u8);
                out.push((values.len() * 2) as u8);
                for v in values {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            Response::Echo {
                function,
                address,
                value,
            } => {
                out.push(*function as u8);
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            Response::Exception { function, code } => {
                out.push(function | 0x80);
                out.push(*code as u8);
            }
        }
    }
}

/// Assemble a full ADU mirroring the request's transaction and unit id.
pub fn encode_adu(header: &MbapHeader, response: &Response) -> Vec<u8> {
    let mut pdu = Vec::new();
    response.encode_pdu(&mut pdu);

    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&header.transaction_id.to_be_bytes());
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    adu.push(header.unit_id);
    adu.extend_from_slice(&pdu);
    adu
}

/// Pack bits LSB-first into bytes, Modbus coil order.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits from Modbus coil-packed bytes.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pdu: &[u8]) -> Request {
        match Request::decode(pdu).unwrap() {
            Decoded::Request(r) => r,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn fault(pdu: &[u8]) -> (u8, ExceptionCode) {
        match Request::decode(pdu).unwrap() {
            Decoded::Fault { function, code } => (function, code),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn header_round_trip() {
        let header = MbapHeader::decode(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0xFF]).unwrap();
        assert_eq!(
            header,
            MbapHeader {
                transaction_id: 0x1234,
                protocol_id: 0,
                length: 6,
                unit_id: 0xFF,
            }
        );
        assert_eq!(header.pdu_len(), 5);
    }

    #[test]
    fn header_rejects_bad_protocol_id() {
        let err = MbapHeader::decode(&[0, 1, 0, 1, 0, 6, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn header_rejects_bad_length_field() {
        // too short to contain a function code
        assert!(MbapHeader::decode(&[0, 1, 0, 0, 0, 1, 0]).is_err());
        // longer than any legal PDU
        assert!(MbapHeader::decode(&[0, 1, 0, 0, 0xFF, 0xFF, 0]).is_err());
    }

    #[test]
    fn decode_read_holding_registers() {
        assert_eq!(
            request(&[0x03, 0x00, 0x02, 0x00, 0x04]),
            Request::ReadHoldingRegisters {
                address: 2,
                count: 4,
            }
        );
    }

    #[test]
    fn decode_write_single_coil() {
        assert_eq!(
            request(&[0x05, 0x00, 0x07, 0xFF, 0x00]),
            Request::WriteSingleCoil {
                address: 7,
                value: true,
            }
        );
        assert_eq!(
            request(&[0x05, 0x00, 0x07, 0x00, 0x00]),
            Request::WriteSingleCoil {
                address: 7,
                value: false,
            }
        );
        // anything but 0x0000/0xFF00 is not a coil state
        assert_eq!(
            fault(&[0x05, 0x00, 0x07, 0x12, 0x34]),
            (0x05, ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn decode_write_multiple_coils() {
        assert_eq!(
            request(&[0x0F, 0x00, 0x01, 0x00, 0x0A, 0x02, 0b0000_0101, 0b0000_0010]),
            Request::WriteMultipleCoils {
                address: 1,
                values: vec![
                    true, false, true, false, false, false, false, false, false, true,
                ],
            }
        );
    }

    #[test]
    fn decode_write_multiple_registers() {
        assert_eq!(
            request(&[0x10, 0x00, 0x02, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]),
            Request::WriteMultipleRegisters {
                address: 2,
                values: vec![0x1234, 0x5678],
            }
        );
    }

    #[test]
    fn decode_read_write_multiple_registers() {
        assert_eq!(
            request(&[
                0x17, 0x00, 0x00, 0x00, 0x02, 0x00, 0x05, 0x00, 0x01, 0x02, 0xAB, 0xCD
            ]),
            Request::ReadWriteMultipleRegisters {
                read_address: 0,
                read_count: 2,
                write_address: 5,
                values: vec![0xABCD],
            }
        );
    }

    #[test]
    fn quantity_ceilings_are_data_value_faults() {
        // zero count
        assert_eq!(
            fault(&[0x03, 0x00, 0x00, 0x00, 0x00]),
            (0x03, ExceptionCode::IllegalDataValue)
        );
        // above the per-function maximum
        assert_eq!(
            fault(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            (0x03, ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            fault(&[0x01, 0x00, 0x00, 0x07, 0xD1]),
            (0x01, ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn byte_count_mismatch_is_data_value_fault() {
        assert_eq!(
            fault(&[0x10, 0x00, 0x02, 0x00, 0x02, 0x03, 0x12, 0x34, 0x56]),
            (0x10, ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn unknown_function_is_illegal_function_fault() {
        assert_eq!(fault(&[0x2B, 0x0E]), (0x2B, ExceptionCode::IllegalFunction));
    }

    #[test]
    fn truncated_pdu_is_protocol_error() {
        assert!(matches!(Request::decode(&[]), Err(Error::Protocol(_))));
        assert!(matches!(
            Request::decode(&[0x03, 0x00, 0x02, 0x00]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_protocol_error() {
        assert!(matches!(
            Request::decode(&[0x03, 0x00, 0x02, 0x00, 0x04, 0xFF]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_register_response() {
        let header = MbapHeader {
            transaction_id: 0x0102,
            protocol_id: 0,
            length: 6,
            unit_id: 0x11,
        };
        let response = Response::Registers {
            function: FunctionCode::ReadHoldingRegisters,
            values: vec![0x1234, 0],
        };
        assert_eq!(
            encode_adu(&header, &response),
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x07, 0x11, 0x03, 0x04, 0x12, 0x34, 0x00, 0x00]
        );
    }

    #[test]
    fn encode_bit_response() {
        let mut pdu = Vec::new();
        Response::Bits {
            function: FunctionCode::ReadCoils,
            values: vec![true, false, true],
        }
        .encode_pdu(&mut pdu);
        assert_eq!(pdu, vec![0x01, 0x01, 0b0000_0101]);
    }

    #[test]
    fn encode_exception_sets_high_bit() {
        let mut pdu = Vec::new();
        Response::Exception {
            function: 0x03,
            code: ExceptionCode::IllegalDataAddress,
        }
        .encode_pdu(&mut pdu);
        assert_eq!(pdu, vec![0x83, 0x02]);
    }

    #[test]
    fn bit_packing_round_trip() {
        let bits = vec![true, true, false, false, true, false, false, false, true];
        assert_eq!(pack_bits(&bits), vec![0b0001_0011, 0b0000_0001]);
        assert_eq!(unpack_bits(&pack_bits(&bits), bits.len()), bits);
    }
}
