use crate::error::ConnectionError;
use crate::socks5::protocol::AddressType;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address represents a network address or domain to be used as the
/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// TargetAddress is the destination requested by a SOCKS5 command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub address: Address,
    pub port: u16,
}

impl TargetAddress {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// address_type returns the SOCKS5 family of the address
    pub fn address_type(&self) -> AddressType {
        match self.address {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// host returns the textual host: dotted quad, domain, or canonical IPv6
    pub fn host(&self) -> String {
        match &self.address {
            Address::IPv4(ip) => ip.to_string(),
            Address::DomainName(domain) => domain.clone(),
            Address::IPv6(ip) => ip.to_string(),
        }
    }

    /// encode serializes the address as ATYP | DST.ADDR | DST.PORT
    pub fn encode(&self) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![self.address_type() as u8];

        match &self.address {
            Address::IPv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::IPv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::DomainName(domain) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    ConnectionError::MalformedRequest(format!(
                        "domain name too long: {} (max 255 bytes)",
                        domain.len()
                    ))
                })?;
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
            }
        }

        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::IPv6(ip) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host(), self.port),
        }
    }
}

/// read_target_address parses DST.ADDR and DST.PORT from a stream positioned
/// just after the ATYP byte of a request. Exactly the bytes the family
/// declares are consumed.
pub async fn read_target_address<R>(
    reader: &mut R,
    atyp: u8,
) -> Result<TargetAddress, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let addr_type = AddressType::from_byte(atyp).ok_or_else(|| {
        ConnectionError::MalformedRequest(format!("unknown address type: {atyp:#04x}"))
    })?;

    // Match type and extract address or domain name
    let address = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            reader
                .read_exact(&mut addr)
                .await
                .map_err(|e| ConnectionError::from_read(e, "IPv4 address"))?;
            Address::IPv4(Ipv4Addr::from(addr))
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let mut len = [0u8; 1];
            reader
                .read_exact(&mut len)
                .await
                .map_err(|e| ConnectionError::from_read(e, "domain length"))?;

            if len[0] == 0 {
                return Err(ConnectionError::MalformedRequest(
                    "domain length cannot be 0".into(),
                ));
            }

            let mut domain = vec![0u8; len[0] as usize];
            reader
                .read_exact(&mut domain)
                .await
                .map_err(|e| ConnectionError::from_read(e, "domain name"))?;

            let domain = String::from_utf8(domain)
                .map_err(|e| ConnectionError::MalformedRequest(format!("invalid domain: {e}")))?;
            Address::DomainName(domain)
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            reader
                .read_exact(&mut addr)
                .await
                .map_err(|e| ConnectionError::from_read(e, "IPv6 address"))?;
            Address::IPv6(Ipv6Addr::from(addr))
        }
    };

    // Read port -> BigEndian (network order)
    let mut port_buf = [0u8; 2];
    reader
        .read_exact(&mut port_buf)
        .await
        .map_err(|e| ConnectionError::from_read(e, "port"))?;

    Ok(TargetAddress::new(address, u16::from_be_bytes(port_buf)))
}
