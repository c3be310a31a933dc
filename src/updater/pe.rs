//! PE header inspection for embedded code-signing evidence
//!
//! Walks a Windows executable's headers to the certificate-table data
//! directory. A non-zero table size means a signature blob is embedded -
//! necessary, but not sufficient, evidence that the binary is signed;
//! validating the blob itself is the installer platform's job.

use std::path::Path;

use log::debug;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// DOS header magic "MZ"
const DOS_MAGIC: u16 = 0x5A4D;
/// Offset of e_lfanew in the DOS header
const E_LFANEW_OFFSET: usize = 0x3C;
/// "PE\0\0"
const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];
/// COFF file header length
const FILE_HEADER_LEN: usize = 20;

const MAGIC_PE32: u16 = 0x10B;
const MAGIC_PE32_PLUS: u16 = 0x20B;

/// Certificate table directory offset within the optional header. The two
/// layouts are mutually exclusive, keyed by the Magic field.
const CERT_TABLE_OFFSET_PE32: usize = 128;
const CERT_TABLE_OFFSET_PE32_PLUS: usize = 144;
/// SizeOfHeaders sits at the same offset in both layouts.
const SIZE_OF_HEADERS_OFFSET: usize = 60;

/// Headers fit comfortably in the first 64 KiB of any real installer.
const HEADER_READ_LIMIT: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not a Windows executable: {0}")]
    NotExecutable(String),

    #[error("truncated image: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
}

/// One entry of the optional header's data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalHeaderKind {
    Pe32,
    Pe32Plus,
}

/// Signing-relevant fields pulled from the optional header.
#[derive(Debug, Clone, Copy)]
pub struct SignatureInfo {
    pub kind: OptionalHeaderKind,
    pub size_of_headers: u32,
    pub certificate_table: DataDirectory,
}

impl SignatureInfo {
    /// Whether a signature blob is embedded at all.
    pub fn is_signed(&self) -> bool {
        self.certificate_table.size != 0
    }
}

fn read_u16(image: &[u8], offset: usize) -> Result<u16, PeError> {
    let bytes: [u8; 2] = image
        .get(offset..offset + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or(PeError::Truncated { offset, needed: 2 })?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(image: &[u8], offset: usize) -> Result<u32, PeError> {
    let bytes: [u8; 4] = image
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(PeError::Truncated { offset, needed: 4 })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Parse the leading bytes of a PE image down to the certificate table.
pub fn parse_signature_info(image: &[u8]) -> Result<SignatureInfo, PeError> {
    if read_u16(image, 0)? != DOS_MAGIC {
        return Err(PeError::NotExecutable("missing MZ header".to_string()));
    }

    let pe_offset = read_u32(image, E_LFANEW_OFFSET)? as usize;
    let signature = image
        .get(pe_offset..pe_offset + 4)
        .ok_or(PeError::Truncated {
            offset: pe_offset,
            needed: 4,
        })?;
    if signature != PE_SIGNATURE {
        return Err(PeError::NotExecutable("missing PE signature".to_string()));
    }

    let optional_offset = pe_offset + 4 + FILE_HEADER_LEN;
    let magic = read_u16(image, optional_offset)?;

    let (kind, cert_offset) = match magic {
        MAGIC_PE32 => (OptionalHeaderKind::Pe32, CERT_TABLE_OFFSET_PE32),
        MAGIC_PE32_PLUS => (OptionalHeaderKind::Pe32Plus, CERT_TABLE_OFFSET_PE32_PLUS),
        other => {
            return Err(PeError::NotExecutable(format!(
                "unsupported optional header magic 0x{:x}",
                other
            )))
        }
    };

    let size_of_headers = read_u32(image, optional_offset + SIZE_OF_HEADERS_OFFSET)?;
    let certificate_table = DataDirectory {
        virtual_address: read_u32(image, optional_offset + cert_offset)?,
        size: read_u32(image, optional_offset + cert_offset + 4)?,
    };

    debug!(
        "parsed {:?} optional header: cert table at 0x{:x}, size 0x{:x}",
        kind, certificate_table.virtual_address, certificate_table.size
    );

    Ok(SignatureInfo {
        kind,
        size_of_headers,
        certificate_table,
    })
}

/// Read the header region of an executable on disk and locate its
/// certificate table.
pub async fn signature_info(path: &Path) -> Result<SignatureInfo, PeError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; HEADER_READ_LIMIT];

    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    header.truncate(filled);

    parse_signature_info(&header)
}
