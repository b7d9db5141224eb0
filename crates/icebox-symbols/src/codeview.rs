use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `'RSDS'`, the CodeView PDB 7.0 signature.
const CV_SIGNATURE_RSDS: u32 = 0x5344_5352;

/// Longest PDB path accepted after the CodeView header.
const MAX_PDB_PATH: usize = 260;

#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CvInfoPdb70 {
    signature: u32,
    guid: [u8; 16],
    age: u32,
    // pdb_path: [u8; ???],
}

/// A CodeView PDB reference extracted from a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeView {
    /// The PDB file name (path component stripped).
    pub name: String,

    /// The `GUID+age` identity string used by symbol servers: 32 uppercase
    /// hex digits with the first three GUID fields endian-swapped, followed
    /// by the age in decimal.
    pub identity: String,
}

/// Scans raw image bytes for an RSDS CodeView record.
///
/// The record can sit anywhere in the mapped image (it lives in the debug
/// data directory, but a flat scan works on partial reads too). The first
/// well-formed record wins.
pub fn find_codeview(image: &[u8]) -> Option<CodeView> {
    for position in memchr::memmem::find_iter(image, b"RSDS") {
        if let Some(codeview) = parse_codeview(&image[position..]) {
            return Some(codeview);
        }

        tracing::trace!(position, "skipping malformed RSDS candidate");
    }

    None
}

fn parse_codeview(data: &[u8]) -> Option<CodeView> {
    if data.len() < size_of::<CvInfoPdb70>() + 1 {
        return None;
    }

    let (info, path) = data.split_at(size_of::<CvInfoPdb70>());
    let info = CvInfoPdb70::ref_from_bytes(info).ok()?;

    if info.signature != CV_SIGNATURE_RSDS {
        return None;
    }

    // The PDB path is nul-terminated and printable.
    let limit = std::cmp::min(path.len(), MAX_PDB_PATH);
    let end = memchr::memchr(0, &path[..limit])?;
    let path = std::str::from_utf8(&path[..end]).ok()?;

    if path.is_empty() || !path.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return None;
    }

    let name = path
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(path)
        .to_string();

    if !name.to_ascii_lowercase().ends_with(".pdb") {
        return None;
    }

    Some(CodeView {
        name,
        identity: format_identity(&info.guid, info.age),
    })
}

/// Formats the symbol-server identity: the first three GUID fields are
/// little-endian on disk and printed big-endian, the trailing eight bytes
/// are printed as stored, and the age follows in decimal.
fn format_identity(guid: &[u8; 16], age: u32) -> String {
    let data1 = u32::from_le_bytes(guid[0..4].try_into().unwrap());
    let data2 = u16::from_le_bytes(guid[4..6].try_into().unwrap());
    let data3 = u16::from_le_bytes(guid[6..8].try_into().unwrap());

    let mut identity = format!("{data1:08X}{data2:04X}{data3:04X}");
    for byte in &guid[8..16] {
        identity.push_str(&format!("{byte:02X}"));
    }
    identity.push_str(&format!("{age}"));
    identity
}
