use crate::error::{Result, RmanError};
use crate::hash::HashAlgorithm;
use crate::manifest::{Bundle, ChunkIndex, Directory, FileEntry, Language, Manifest};
use crate::table::{Buf, Table};
use std::io::Read;

pub const MAGIC: &[u8; 4] = b"RMAN";
pub const HEADER_LEN: usize = 28;

#[derive(Clone, Copy, Debug)]
pub struct DecodeLimits {
    pub max_body_bytes: usize,
    pub max_vector_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self { max_body_bytes: 256 * 1024 * 1024, max_vector_len: 1_000_000 }
    }
}

/// Fixed container header preceding the compressed body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    pub body_offset: u32,
    pub compressed_len: u32,
    pub manifest_id: u64,
    pub body_len: u32,
}

pub fn read_header(data: &[u8]) -> Result<Header> {
    if data.len() < HEADER_LEN {
        return Err(RmanError::format(format!("container too short: {} bytes", data.len())));
    }
    if &data[0..4] != MAGIC {
        return Err(RmanError::format("bad magic"));
    }
    let mut u32b = [0u8; 4];
    let mut u64b = [0u8; 8];
    let mut u32_at = |pos: usize| {
        u32b.copy_from_slice(&data[pos..pos + 4]);
        u32::from_le_bytes(u32b)
    };
    let body_offset = u32_at(8);
    let compressed_len = u32_at(12);
    let body_len = u32_at(24);
    u64b.copy_from_slice(&data[16..24]);
    Ok(Header {
        major: data[4],
        minor: data[5],
        body_offset,
        compressed_len,
        manifest_id: u64::from_le_bytes(u64b),
        body_len,
    })
}

/// Decompress the body described by `header`, bounded by `limits`.
pub fn read_body(data: &[u8], header: &Header, limits: &DecodeLimits) -> Result<Vec<u8>> {
    let start = header.body_offset as usize;
    let end = start
        .checked_add(header.compressed_len as usize)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            RmanError::format(format!(
                "body [{start}, +{}) exceeds container of {} bytes",
                header.compressed_len,
                data.len()
            ))
        })?;
    let limit = limits.max_body_bytes;
    let decoder = zstd::stream::read::Decoder::new(&data[start..end])
        .map_err(|e| RmanError::format(format!("zstd init: {e}")))?
        .single_frame();
    let mut body = Vec::with_capacity((header.body_len as usize).min(limit).min(16 << 20));
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| RmanError::format(format!("zstd decompress body: {e}")))?;
    if body.len() > limit {
        return Err(RmanError::format(format!("body exceeds limit of {limit} bytes")));
    }
    if body.len() != header.body_len as usize {
        return Err(RmanError::SizeMismatch {
            expected: header.body_len as u64,
            actual: body.len() as u64,
        });
    }
    Ok(body)
}

pub fn decode(data: &[u8]) -> Result<Manifest> {
    decode_with_limits(data, &DecodeLimits::default())
}

pub fn decode_with_limits(data: &[u8], limits: &DecodeLimits) -> Result<Manifest> {
    let header = read_header(data)?;
    let body = read_body(data, &header, limits)?;
    let root = Buf::new(&body, limits.max_vector_len).root()?;
    let manifest = decode_root(root, &header)?;
    tracing::debug!(
        manifest_id = format_args!("{:016X}", manifest.id()),
        bundles = manifest.bundles().len(),
        files = manifest.files().len(),
        "decoded manifest"
    );
    Ok(manifest)
}

fn decode_root(root: Table<'_>, header: &Header) -> Result<Manifest> {
    let bundles = root.tables(0)?.into_iter().map(decode_bundle).collect::<Result<Vec<_>>>()?;

    let languages = root
        .tables(1)?
        .into_iter()
        .map(|t| Ok(Language { id: t.u8(0)?, name: t.string(1)?.to_string() }))
        .collect::<Result<Vec<_>>>()?;

    let directories = root
        .tables(3)?
        .into_iter()
        .map(|t| {
            Ok(Directory { id: t.u64(0)?, parent_id: t.u64(1)?, name: t.string(2)?.to_string() })
        })
        .collect::<Result<Vec<_>>>()?;

    let algorithms = root
        .tables(5)?
        .into_iter()
        .map(|t| Ok(HashAlgorithm::from_tag(t.u8(1)?)))
        .collect::<Result<Vec<_>>>()?;

    let index = ChunkIndex::build(&bundles);
    let files = root
        .tables(2)?
        .into_iter()
        .map(|t| decode_file(t, &bundles, &index, &languages, &algorithms))
        .collect::<Result<Vec<_>>>()?;

    Ok(Manifest::assemble(
        header.manifest_id,
        (header.major, header.minor),
        bundles,
        index,
        languages,
        files,
        directories,
    ))
}

fn decode_bundle(t: Table<'_>) -> Result<Bundle> {
    let id = t.u64(0)?;
    let records = t
        .tables(1)?
        .into_iter()
        .map(|c| Ok((c.u64(0)?, c.u32(1)?, c.u32(2)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Bundle::from_records(id, records))
}

fn decode_file(
    t: Table<'_>,
    bundles: &[Bundle],
    index: &ChunkIndex,
    languages: &[Language],
    algorithms: &[HashAlgorithm],
) -> Result<FileEntry> {
    let mask = t.u64(4)?;
    let language_ids = (0..64u32)
        .filter(|bit| mask & (1u64 << bit) != 0)
        .filter_map(|bit| languages.iter().find(|l| l.id as u32 == bit + 1).map(|l| l.id))
        .collect();
    let hash_algorithm = algorithms.get(t.u8(11)? as usize).copied().unwrap_or_default();
    let chunk_ids = t.u64_vector(7)?;
    Ok(FileEntry {
        id: t.u64(0)?,
        name: t.string(3)?.to_string(),
        size: t.u64(2)?,
        directory_id: t.u64(1)?,
        hash_algorithm,
        language_ids,
        chunks: index.layout(bundles, &chunk_ids)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{ChunkRecord, FileRecord, ManifestWriter};

    fn scenario_writer() -> ManifestWriter {
        let mut w = ManifestWriter::new();
        w.add_bundle(
            1,
            vec![
                ChunkRecord { id: 0x1111, compressed_size: 5, uncompressed_size: 8 },
                ChunkRecord { id: 0x2222, compressed_size: 5, uncompressed_size: 8 },
            ],
        );
        w.add_hash_param(HashAlgorithm::Sha256);
        w.add_file(FileRecord {
            id: 9,
            directory_id: 0,
            size: 16,
            name: "a.txt".into(),
            language_mask: 0,
            chunk_ids: vec![0x1111, 0x2222],
            hash_param_index: 0,
        });
        w
    }

    #[test]
    fn scenario_offsets() {
        let m = decode(&scenario_writer().finish(0xC0FFEE).unwrap()).unwrap();
        assert_eq!(m.id(), 0xC0FFEE);
        let file = m.file("a.txt").unwrap();
        assert_eq!(file.size, 16);
        let placed: Vec<_> = m
            .file_chunks(file)
            .map(|(c, off)| (c.id, c.bundle_offset, off))
            .collect();
        assert_eq!(placed, vec![(0x1111, 0, 0), (0x2222, 5, 8)]);
    }

    #[test]
    fn header_fields_are_little_endian() {
        let bytes = scenario_writer().finish(0x0102_0304_0506_0708).unwrap();
        let h = read_header(&bytes).unwrap();
        assert_eq!(h.manifest_id, 0x0102_0304_0506_0708);
        assert_eq!(h.body_offset as usize, HEADER_LEN);
        assert_eq!(h.compressed_len as usize, bytes.len() - HEADER_LEN);
        assert_eq!((h.major, h.minor), (2, 0));
    }

    #[test]
    fn bad_magic_is_format_error() {
        let mut bytes = scenario_writer().finish(1).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(RmanError::Format(_))));
        assert!(matches!(decode(&bytes[..10]), Err(RmanError::Format(_))));
    }

    #[test]
    fn declared_body_length_must_match() {
        let mut bytes = scenario_writer().finish(1).unwrap();
        let declared = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        bytes[24..28].copy_from_slice(&(declared + 1).to_le_bytes());
        match decode(&bytes) {
            Err(RmanError::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, declared as u64 + 1);
                assert_eq!(actual, declared as u64);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn body_range_outside_container_is_format_error() {
        let mut bytes = scenario_writer().finish(1).unwrap();
        bytes[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(RmanError::Format(_))));
    }

    #[test]
    fn body_limit_is_enforced() {
        let bytes = scenario_writer().finish(1).unwrap();
        let limits = DecodeLimits { max_body_bytes: 8, ..DecodeLimits::default() };
        assert!(matches!(decode_with_limits(&bytes, &limits), Err(RmanError::Format(_))));
    }

    #[test]
    fn language_mask_maps_to_declared_ids() {
        let mut w = scenario_writer();
        w.add_language(1, "en_US");
        w.add_language(3, "fr_FR");
        w.add_file(FileRecord {
            id: 10,
            directory_id: 0,
            size: 8,
            name: "fr.wad".into(),
            // bits 0 and 2 -> ids 1 and 3; bit 5 has no declared language
            language_mask: 0b10_0101,
            chunk_ids: vec![0x1111],
            hash_param_index: 0,
        });
        let m = decode(&w.finish(1).unwrap()).unwrap();
        assert_eq!(m.file("fr.wad").unwrap().language_ids, vec![1, 3]);
        assert!(m.file("a.txt").unwrap().is_neutral());
    }

    #[test]
    fn hash_param_index_out_of_range_defaults_to_sha256() {
        let mut w = ManifestWriter::new();
        w.add_bundle(1, vec![ChunkRecord { id: 5, compressed_size: 1, uncompressed_size: 1 }]);
        w.add_hash_param(HashAlgorithm::Blake3);
        for (id, idx) in [(1u64, 0u8), (2, 7)] {
            w.add_file(FileRecord {
                id,
                directory_id: 0,
                size: 1,
                name: format!("f{id}"),
                language_mask: 0,
                chunk_ids: vec![5],
                hash_param_index: idx,
            });
        }
        let m = decode(&w.finish(1).unwrap()).unwrap();
        assert_eq!(m.file("f1").unwrap().hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(m.file("f2").unwrap().hash_algorithm, HashAlgorithm::Sha256);
    }

    #[test]
    fn directories_are_resolved_during_decode() {
        let mut w = ManifestWriter::new();
        w.add_bundle(1, vec![ChunkRecord { id: 5, compressed_size: 1, uncompressed_size: 1 }]);
        w.add_directory(10, 20, "A");
        w.add_directory(20, 0, "B");
        w.add_file(FileRecord {
            id: 1,
            directory_id: 10,
            size: 1,
            name: "x.bin".into(),
            language_mask: 0,
            chunk_ids: vec![5],
            hash_param_index: 0,
        });
        let m = decode(&w.finish(1).unwrap()).unwrap();
        assert_eq!(m.files()[0].name, "B/A/x.bin");
        assert_eq!(m.directories().len(), 2);
    }

    #[test]
    fn corrupted_bodies_never_panic() {
        let bytes = scenario_writer().finish(1).unwrap();
        let header = read_header(&bytes).unwrap();
        let body = read_body(&bytes, &header, &DecodeLimits::default()).unwrap();
        fastrand::seed(7);
        for _ in 0..500 {
            let mut mangled = body.clone();
            for _ in 0..4 {
                let i = fastrand::usize(..mangled.len());
                mangled[i] = fastrand::u8(..);
            }
            if let Ok(root) = Buf::new(&mangled, 1024).root() {
                let _ = decode_root(root, &header);
            }
        }
    }
}
