//! Compound address parsing
//!
//! A compound address is a packed run of `(tag, length, data)` elements:
//!
//! ```text
//! [TOTAL_SIZE tag][len=4][u32 total byte length]
//! [tag][len][data...]
//! [tag][len][data...]
//! ...
//! ```
//!
//! Tags are 128-bit GUIDs stored in their mixed-endian in-memory layout,
//! lengths are little-endian `u32`. The first element must be the total
//! size element, otherwise the buffer decodes to nothing.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

/// Tag of the mandatory leading element carrying the whole buffer length
pub const TOTAL_SIZE: Uuid = Uuid::from_u128(0x1318f560_912c_11d0_9daa_00a0c90a43cb);
/// Tag of the element naming the selected service provider (a GUID)
pub const SERVICE_PROVIDER: Uuid = Uuid::from_u128(0x07d916c0_e0af_11cf_9c4e_00a0c905425e);
/// Tag of the element carrying a NUL-terminated address string
pub const INET: Uuid = Uuid::from_u128(0xc4a54da0_e0af_11cf_9c4e_00a0c905425e);

const TAG_LEN: usize = 16;
const HEADER_LEN: usize = TAG_LEN + 4;

/// One decoded element, borrowing its data from the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressElement<'a> {
    pub tag: Uuid,
    pub data: &'a [u8],
}

/// Decoded view over a compound address buffer
#[derive(Debug, Clone, Default)]
pub struct CompoundAddress<'a> {
    elements: Vec<AddressElement<'a>>,
}

/// Read one element header off the front of `buf`
fn get_header(buf: &mut impl Buf) -> Option<(Uuid, usize)> {
    if buf.remaining() < HEADER_LEN {
        return None;
    }
    let tag = Uuid::from_bytes_le(buf.get_u128_le().to_le_bytes());
    let len = buf.get_u32_le() as usize;
    Some((tag, len))
}

impl<'a> CompoundAddress<'a> {
    pub fn builder() -> AddressBuilder {
        AddressBuilder::new()
    }

    /// Decode every element of `buf`.
    ///
    /// Elements that would run past the declared total size are dropped
    /// rather than treated as an error. Nothing is ever read past `buf`.
    pub fn decode(buf: &'a [u8]) -> Self {
        let mut elements = Vec::new();

        let mut rest = buf;
        let Some((tag, size_len)) = get_header(&mut rest) else {
            return Self { elements };
        };
        if tag != TOTAL_SIZE || size_len == 0 {
            return Self { elements };
        }
        let Ok(total) = rest.try_get_uint_le(size_len.min(8)) else {
            return Self { elements };
        };

        let end = usize::try_from(total).unwrap_or(usize::MAX).min(buf.len());
        let mut rest = buf[..end].get(HEADER_LEN.saturating_add(size_len)..).unwrap_or_default();
        while rest.has_remaining() {
            let Some((tag, len)) = get_header(&mut rest) else {
                break;
            };
            if rest.remaining() < len {
                tracing::debug!(tag = %tag, len, "Dropping overrunning address element");
                break;
            }
            let (data, tail) = rest.split_at(len);
            elements.push(AddressElement { tag, data });
            rest = tail;
        }

        Self { elements }
    }

    pub fn elements(&self) -> &[AddressElement<'a>] {
        &self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// First element carrying `tag`
    pub fn find(&self, tag: Uuid) -> Option<&'a [u8]> {
        self.elements.iter().find(|e| e.tag == tag).map(|e| e.data)
    }

    /// The explicitly selected service provider, if well formed
    pub fn service_provider(&self) -> Option<Uuid> {
        self.elements
            .iter()
            .filter(|e| e.tag == SERVICE_PROVIDER)
            .find_map(|e| match <[u8; TAG_LEN]>::try_from(e.data) {
                Ok(bytes) => Some(Uuid::from_bytes_le(bytes)),
                Err(_) => {
                    tracing::warn!(len = e.data.len(), "Service provider element is malformed");
                    None
                }
            })
    }

    /// The address string element with its terminator stripped
    pub fn inet_address(&self) -> Option<&'a str> {
        let data = self.find(INET)?;
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..end]).ok()
    }

    /// Dump every element at debug level
    pub fn log(&self) {
        for element in &self.elements {
            let bytes: Vec<String> = element.data.iter().map(|b| format!("{:02x}", b)).collect();
            tracing::debug!(tag = %element.tag, len = element.data.len(), data = %bytes.join(" "), "Address element");
        }
    }
}

/// Builds well-formed compound address buffers
#[derive(Debug, Clone, Default)]
pub struct AddressBuilder {
    elements: Vec<(Uuid, Vec<u8>)>,
}

impl AddressBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, tag: Uuid, data: impl Into<Vec<u8>>) -> Self {
        self.elements.push((tag, data.into()));
        self
    }

    pub fn service_provider(self, provider: Uuid) -> Self {
        let bytes = provider.to_bytes_le();
        self.element(SERVICE_PROVIDER, bytes.to_vec())
    }

    pub fn inet(self, address: &str) -> Self {
        let mut data = address.as_bytes().to_vec();
        data.push(0);
        self.element(INET, data)
    }

    pub fn build(self) -> Vec<u8> {
        let total = HEADER_LEN
            + 4
            + self
                .elements
                .iter()
                .map(|(_, data)| HEADER_LEN + data.len())
                .sum::<usize>();

        let mut buf = BytesMut::with_capacity(total);
        put_element(&mut buf, TOTAL_SIZE, &(total as u32).to_le_bytes());
        for (tag, data) in &self.elements {
            put_element(&mut buf, *tag, data);
        }
        buf.to_vec()
    }
}

fn put_element(buf: &mut impl BufMut, tag: Uuid, data: &[u8]) {
    buf.put_slice(&tag.to_bytes_le());
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}
