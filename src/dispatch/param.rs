use anyhow::bail;
use bytes::BufMut;
use crc::Crc;
use crate::rpc_stream::RpcStream;

/// The maximum length of a string or blob parameter. Longer values are rejected when they are
///  read, since the length comes from the wire.
pub const MAX_VARIABLE_LENGTH: usize = 16 * 1024 * 1024;

const HASHER: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Parameter types on the wire:
///
/// ```ascii
/// uint32, int32:   4 bytes LE
/// uint64, int64:   8 bytes LE
/// string, blob:    length (u32 LE), followed by that many bytes; strings are UTF-8
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    Uint32,
    Uint64,
    Int32,
    Int64,
    String,
    Blob,
}

impl ParamType {
    /// the type for a name as it is used in interface definitions
    pub fn from_name(name: &str) -> Option<ParamType> {
        match name {
            "uint32" => Some(ParamType::Uint32),
            "uint64" => Some(ParamType::Uint64),
            "int32" => Some(ParamType::Int32),
            "int64" => Some(ParamType::Int64),
            "string" => Some(ParamType::String),
            "blob" => Some(ParamType::Blob),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamType::Uint32 => "uint32",
            ParamType::Uint64 => "uint64",
            ParamType::Int32 => "int32",
            ParamType::Int64 => "int64",
            ParamType::String => "string",
            ParamType::Blob => "blob",
        }
    }

    /// the default value for this type
    pub fn create(self) -> ParamValue {
        match self {
            ParamType::Uint32 => ParamValue::Uint32(0),
            ParamType::Uint64 => ParamValue::Uint64(0),
            ParamType::Int32 => ParamValue::Int32(0),
            ParamType::Int64 => ParamValue::Int64(0),
            ParamType::String => ParamValue::String(String::new()),
            ParamType::Blob => ParamValue::Blob(Vec::new()),
        }
    }

    pub async fn read(self, stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<ParamValue> {
        let value = match self {
            ParamType::Uint32 => ParamValue::Uint32(u32::from_le_bytes(read_array(stream).await?)),
            ParamType::Uint64 => ParamValue::Uint64(u64::from_le_bytes(read_array(stream).await?)),
            ParamType::Int32 => ParamValue::Int32(i32::from_le_bytes(read_array(stream).await?)),
            ParamType::Int64 => ParamValue::Int64(i64::from_le_bytes(read_array(stream).await?)),
            ParamType::String => {
                let raw = read_variable(stream).await?;
                match String::from_utf8(raw) {
                    Ok(s) => ParamValue::String(s),
                    Err(_) => bail!("string parameter is not valid UTF-8"),
                }
            }
            ParamType::Blob => ParamValue::Blob(read_variable(stream).await?),
        };
        Ok(value)
    }
}

async fn read_array<const N: usize>(stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<[u8; N]> {
    let mut buf = [0u8; N];
    stream.read(&mut buf).await?;
    Ok(buf)
}

async fn read_variable(stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<Vec<u8>> {
    let len = u32::from_le_bytes(read_array(stream).await?) as usize;
    if len > MAX_VARIABLE_LENGTH {
        bail!("parameter length {} exceeds the maximum of {}", len, MAX_VARIABLE_LENGTH);
    }

    let mut buf = vec![0u8; len];
    stream.read(&mut buf).await?;
    Ok(buf)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    Uint32(u32),
    Uint64(u64),
    Int32(i32),
    Int64(i64),
    String(String),
    Blob(Vec<u8>),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Uint32(_) => ParamType::Uint32,
            ParamValue::Uint64(_) => ParamType::Uint64,
            ParamValue::Int32(_) => ParamType::Int32,
            ParamValue::Int64(_) => ParamType::Int64,
            ParamValue::String(_) => ParamType::String,
            ParamValue::Blob(_) => ParamType::Blob,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ParamValue::Uint32(v) => buf.put_u32_le(*v),
            ParamValue::Uint64(v) => buf.put_u64_le(*v),
            ParamValue::Int32(v) => buf.put_i32_le(*v),
            ParamValue::Int64(v) => buf.put_i64_le(*v),
            ParamValue::String(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            ParamValue::Blob(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    pub async fn write(&self, stream: &mut (dyn RpcStream + '_)) -> anyhow::Result<()> {
        match self {
            ParamValue::String(s) => write_variable(stream, s.as_bytes()).await,
            ParamValue::Blob(b) => write_variable(stream, b).await,
            fixed => {
                let mut buf = Vec::with_capacity(size_of::<u64>());
                fixed.ser(&mut buf);
                stream.write(&buf).await
            }
        }
    }

    /// Chains a hash of this value onto `start`, so that the hashes of several values can be
    ///  combined
    pub fn hash(&self, start: u32) -> u32 {
        let mut buf = Vec::new();
        self.ser(&mut buf);

        let mut digest = HASHER.digest_with_initial(start);
        digest.update(&buf);
        digest.finalize()
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ParamValue::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ParamValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Uint32(value)
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Uint64(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int32(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int64(value)
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(value: Vec<u8>) -> Self {
        ParamValue::Blob(value)
    }
}

impl From<&[u8]> for ParamValue {
    fn from(value: &[u8]) -> Self {
        ParamValue::Blob(value.to_vec())
    }
}

async fn write_variable(stream: &mut (dyn RpcStream + '_), data: &[u8]) -> anyhow::Result<()> {
    if data.len() > MAX_VARIABLE_LENGTH {
        bail!("parameter length {} exceeds the maximum of {}", data.len(), MAX_VARIABLE_LENGTH);
    }
    stream.write(&(data.len() as u32).to_le_bytes()).await?;
    stream.write(data).await
}
