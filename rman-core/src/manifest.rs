use crate::error::{Result, RmanError};
use crate::hash::HashAlgorithm;
use crate::paths;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub id: u64,
    pub bundle_id: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Sum of the compressed sizes of the chunks declared before this one in its bundle.
    pub bundle_offset: u64,
}

#[derive(Serialize, Clone, Debug)]
pub struct Bundle {
    pub id: u64,
    pub chunks: Vec<Chunk>,
}

impl Bundle {
    /// Build a bundle from `(id, compressed, uncompressed)` records in declared order.
    pub fn from_records(id: u64, records: impl IntoIterator<Item = (u64, u32, u32)>) -> Self {
        let mut offset = 0u64;
        let chunks = records
            .into_iter()
            .map(|(chunk_id, compressed_size, uncompressed_size)| {
                let chunk = Chunk {
                    id: chunk_id,
                    bundle_id: id,
                    compressed_size,
                    uncompressed_size,
                    bundle_offset: offset,
                };
                offset += compressed_size as u64;
                chunk
            })
            .collect();
        Self { id, chunks }
    }

    /// `{id:016X}.bundle`, the resource name under a CDN base URL.
    pub fn file_name(id: u64) -> String {
        format!("{id:016X}.bundle")
    }
}

/// A chunk as referenced by one file.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: u64,
    pub file_offset: u64,
}

#[derive(Serialize, Clone, Debug)]
pub struct FileEntry {
    pub id: u64,
    /// Leaf name as decoded, full `/`-joined path once the manifest is assembled.
    pub name: String,
    pub size: u64,
    pub directory_id: u64,
    pub hash_algorithm: HashAlgorithm,
    /// Empty for language-neutral files.
    pub language_ids: Vec<u8>,
    pub chunks: Vec<ChunkRef>,
}

impl FileEntry {
    pub fn chunk_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chunks.iter().map(|c| c.id)
    }

    pub fn is_neutral(&self) -> bool {
        self.language_ids.is_empty()
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct Directory {
    pub id: u64,
    pub parent_id: u64,
    pub name: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct Language {
    pub id: u8,
    pub name: String,
}

/// Chunk id -> (bundle index, chunk index). First declaration wins.
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkIndex(HashMap<u64, (usize, usize)>);

impl ChunkIndex {
    pub(crate) fn build(bundles: &[Bundle]) -> Self {
        let mut map = HashMap::new();
        for (bi, bundle) in bundles.iter().enumerate() {
            for (ci, chunk) in bundle.chunks.iter().enumerate() {
                map.entry(chunk.id).or_insert((bi, ci));
            }
        }
        Self(map)
    }

    fn get<'m>(&self, bundles: &'m [Bundle], id: u64) -> Option<&'m Chunk> {
        self.0.get(&id).map(|&(bi, ci)| &bundles[bi].chunks[ci])
    }

    /// Lay `chunk_ids` out back to back, each at the running sum of uncompressed sizes.
    pub(crate) fn layout(&self, bundles: &[Bundle], chunk_ids: &[u64]) -> Result<Vec<ChunkRef>> {
        let mut offset = 0u64;
        chunk_ids
            .iter()
            .map(|&id| {
                let chunk = self.get(bundles, id).ok_or_else(|| {
                    RmanError::format(format!("chunk {id:016X} is not declared by any bundle"))
                })?;
                let r = ChunkRef { id, file_offset: offset };
                offset += chunk.uncompressed_size as u64;
                Ok(r)
            })
            .collect()
    }
}

/// Decoded manifest. Built once, read-only afterwards.
#[derive(Serialize, Debug, Clone)]
pub struct Manifest {
    id: u64,
    version: (u8, u8),
    bundles: Vec<Bundle>,
    languages: Vec<Language>,
    files: Vec<FileEntry>,
    directories: Vec<Directory>,
    #[serde(skip)]
    index: ChunkIndex,
    #[serde(skip)]
    paths_resolved: bool,
}

impl Manifest {
    pub(crate) fn assemble(
        id: u64,
        version: (u8, u8),
        bundles: Vec<Bundle>,
        index: ChunkIndex,
        languages: Vec<Language>,
        files: Vec<FileEntry>,
        directories: Vec<Directory>,
    ) -> Self {
        let mut manifest = Self {
            id,
            version,
            bundles,
            languages,
            files,
            directories,
            index,
            paths_resolved: false,
        };
        manifest.resolve_paths();
        manifest
    }

    /// Rewrite file names into full paths. Only the first call has any effect.
    fn resolve_paths(&mut self) -> bool {
        if self.paths_resolved {
            return false;
        }
        paths::resolve(&mut self.files, &self.directories);
        self.paths_resolved = true;
        true
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn directories(&self) -> &[Directory] {
        &self.directories
    }

    pub fn chunk(&self, id: u64) -> Option<&Chunk> {
        self.index.get(&self.bundles, id)
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == path)
    }

    /// A file's chunks paired with their destination offsets, in file order.
    pub fn file_chunks<'m>(
        &'m self,
        file: &'m FileEntry,
    ) -> impl Iterator<Item = (&'m Chunk, u64)> + 'm {
        file.chunks.iter().filter_map(move |r| self.chunk(r.id).map(|c| (c, r.file_offset)))
    }

    /// Map language names (case-insensitive) to declared ids; unknown names are returned apart.
    pub fn language_ids(&self, names: &[String]) -> (Vec<u8>, Vec<String>) {
        let mut ids = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            match self.languages.iter().find(|l| l.name.eq_ignore_ascii_case(name)) {
                Some(lang) => ids.push(lang.id),
                None => unknown.push(name.clone()),
            }
        }
        (ids, unknown)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Manifest {
        let bundles = vec![Bundle::from_records(1, [(0xA1, 5, 8), (0xA2, 5, 8)])];
        let index = ChunkIndex::build(&bundles);
        let chunks = index.layout(&bundles, &[0xA1, 0xA2]).unwrap();
        let files = vec![FileEntry {
            id: 7,
            name: "a.txt".into(),
            size: 16,
            directory_id: 0,
            hash_algorithm: HashAlgorithm::Sha256,
            language_ids: vec![],
            chunks,
        }];
        let languages = vec![Language { id: 1, name: "en_US".into() }];
        Manifest::assemble(42, (2, 0), bundles, index, languages, files, vec![])
    }

    #[test]
    fn offsets_are_derived_once_per_bundle_and_file() {
        let m = scenario();
        let file = &m.files()[0];
        let placed: Vec<_> = m.file_chunks(file).map(|(c, off)| (c.bundle_offset, off)).collect();
        assert_eq!(placed, vec![(0, 0), (5, 8)]);
        assert_eq!(m.chunk(0xA2).unwrap().bundle_id, 1);
        assert!(m.chunk(0xFF).is_none());
    }

    #[test]
    fn unknown_chunk_reference_is_a_format_error() {
        let bundles = vec![Bundle::from_records(1, [(0xA1, 5, 8)])];
        let index = ChunkIndex::build(&bundles);
        assert!(matches!(index.layout(&bundles, &[0xA1, 0xB0]), Err(RmanError::Format(_))));
    }

    #[test]
    fn path_resolution_runs_once() {
        let mut m = scenario();
        assert!(!m.resolve_paths());
        assert_eq!(m.files()[0].name, "a.txt");
    }

    #[test]
    fn language_lookup_is_case_insensitive() {
        let m = scenario();
        let (ids, unknown) = m.language_ids(&["EN_us".into(), "xx_XX".into()]);
        assert_eq!(ids, vec![1]);
        assert_eq!(unknown, vec!["xx_XX".to_string()]);
    }

    #[test]
    fn bundle_file_name_is_uppercase_hex() {
        assert_eq!(Bundle::file_name(0xABC), "0000000000000ABC.bundle");
    }
}
