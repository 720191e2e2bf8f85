use crate::decode::{HEADER_LEN, MAGIC};
use crate::error::{Result, RmanError};
use crate::hash::{chunk_id, HashAlgorithm};
use crate::manifest::Bundle;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

#[derive(Clone, Debug, Default)]
pub struct FileRecord {
    pub id: u64,
    pub directory_id: u64,
    pub size: u64,
    /// Leaf name; directories are referenced through `directory_id`.
    pub name: String,
    pub language_mask: u64,
    pub chunk_ids: Vec<u64>,
    pub hash_param_index: u8,
}

enum Field {
    U8(u8),
    U32(u32),
    U64(u64),
    Str(String),
    U64s(Vec<u64>),
    Tables(Vec<Obj>),
}

/// An object as `(slot, value)` pairs.
struct Obj(Vec<(usize, Field)>);

/// Lays objects out front to back so every reference is a forward offset.
#[derive(Default)]
struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn rel(&mut self, slot_pos: usize, target: usize) {
        self.patch_u32(slot_pos, (target - slot_pos) as u32);
    }

    fn object(&mut self, obj: &Obj) -> usize {
        let slots = obj.0.iter().map(|(s, _)| s + 1).max().unwrap_or(0);
        let vt_len = 4 + 2 * slots;
        let vt_pos = self.buf.len();
        self.buf.resize(vt_pos + vt_len, 0);

        let pos = self.buf.len();
        self.buf.extend_from_slice(&((pos - vt_pos) as i32).to_le_bytes());
        let mut deferred = Vec::new();
        for (slot, field) in &obj.0 {
            let at = self.buf.len();
            let in_obj = (at - pos) as u16;
            self.buf[vt_pos + 4 + 2 * slot..vt_pos + 6 + 2 * slot]
                .copy_from_slice(&in_obj.to_le_bytes());
            match field {
                Field::U8(v) => self.buf.push(*v),
                Field::U32(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
                Field::U64(v) => self.buf.extend_from_slice(&v.to_le_bytes()),
                _ => {
                    self.buf.extend_from_slice(&[0u8; 4]);
                    deferred.push((at, field));
                }
            }
        }
        let obj_len = (self.buf.len() - pos) as u16;
        self.buf[vt_pos..vt_pos + 2].copy_from_slice(&(vt_len as u16).to_le_bytes());
        self.buf[vt_pos + 2..vt_pos + 4].copy_from_slice(&obj_len.to_le_bytes());

        for (at, field) in deferred {
            let target = self.buf.len();
            match field {
                Field::Str(s) => {
                    self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    self.buf.extend_from_slice(s.as_bytes());
                }
                Field::U64s(v) => {
                    self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    for x in v {
                        self.buf.extend_from_slice(&x.to_le_bytes());
                    }
                }
                Field::Tables(objs) => self.tables(objs),
                Field::U8(_) | Field::U32(_) | Field::U64(_) => unreachable!("scalars are inline"),
            }
            self.rel(at, target);
        }
        pos
    }

    fn tables(&mut self, objs: &[Obj]) {
        let start = self.buf.len();
        self.buf.extend_from_slice(&(objs.len() as u32).to_le_bytes());
        self.buf.resize(start + 4 + 4 * objs.len(), 0);
        for (i, obj) in objs.iter().enumerate() {
            let target = self.object(obj);
            self.rel(start + 4 + 4 * i, target);
        }
    }
}

/// Collects manifest records and serialises them into an RMAN container.
#[derive(Default)]
pub struct ManifestWriter {
    bundles: Vec<(u64, Vec<ChunkRecord>)>,
    languages: Vec<(u8, String)>,
    directories: Vec<(u64, u64, String)>,
    files: Vec<FileRecord>,
    hash_params: Vec<HashAlgorithm>,
}

impl ManifestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bundle(&mut self, id: u64, chunks: Vec<ChunkRecord>) {
        self.bundles.push((id, chunks));
    }

    pub fn add_language(&mut self, id: u8, name: &str) {
        self.languages.push((id, name.to_string()));
    }

    pub fn add_directory(&mut self, id: u64, parent_id: u64, name: &str) {
        self.directories.push((id, parent_id, name.to_string()));
    }

    pub fn add_file(&mut self, file: FileRecord) {
        self.files.push(file);
    }

    /// Returns the index files use to select this algorithm.
    pub fn add_hash_param(&mut self, algorithm: HashAlgorithm) -> u8 {
        self.hash_params.push(algorithm);
        (self.hash_params.len() - 1) as u8
    }

    fn root(&self) -> Obj {
        let bundles = self
            .bundles
            .iter()
            .map(|(id, chunks)| {
                let chunks = chunks
                    .iter()
                    .map(|c| {
                        Obj(vec![
                            (0, Field::U64(c.id)),
                            (1, Field::U32(c.compressed_size)),
                            (2, Field::U32(c.uncompressed_size)),
                        ])
                    })
                    .collect();
                Obj(vec![(0, Field::U64(*id)), (1, Field::Tables(chunks))])
            })
            .collect();
        let languages = self
            .languages
            .iter()
            .map(|(id, name)| Obj(vec![(0, Field::U8(*id)), (1, Field::Str(name.clone()))]))
            .collect();
        let files = self
            .files
            .iter()
            .map(|f| {
                Obj(vec![
                    (0, Field::U64(f.id)),
                    (1, Field::U64(f.directory_id)),
                    (2, Field::U64(f.size)),
                    (3, Field::Str(f.name.clone())),
                    (4, Field::U64(f.language_mask)),
                    (7, Field::U64s(f.chunk_ids.clone())),
                    (11, Field::U8(f.hash_param_index)),
                ])
            })
            .collect();
        let directories = self
            .directories
            .iter()
            .map(|(id, parent, name)| {
                Obj(vec![
                    (0, Field::U64(*id)),
                    (1, Field::U64(*parent)),
                    (2, Field::Str(name.clone())),
                ])
            })
            .collect();
        let params = self
            .hash_params
            .iter()
            .map(|a| Obj(vec![(1, Field::U8(a.tag()))]))
            .collect();
        Obj(vec![
            (0, Field::Tables(bundles)),
            (1, Field::Tables(languages)),
            (2, Field::Tables(files)),
            (3, Field::Tables(directories)),
            (5, Field::Tables(params)),
        ])
    }

    /// Uncompressed table body.
    pub fn body(&self) -> Vec<u8> {
        let mut w = BodyWriter::default();
        w.buf.extend_from_slice(&[0u8; 4]);
        let root = w.object(&self.root());
        w.patch_u32(0, root as u32);
        w.buf
    }

    /// Complete container: header followed by the zstd-compressed body.
    pub fn finish(&self, manifest_id: u64) -> Result<Vec<u8>> {
        let body = self.body();
        let compressed = zstd::bulk::compress(&body, 3)?;
        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
        out.extend_from_slice(MAGIC);
        out.push(2); // major
        out.push(0); // minor
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&manifest_id.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

/// Builds one `.bundle` blob out of independently compressed chunks.
pub struct BundleWriter {
    algorithm: HashAlgorithm,
    level: i32,
    data: Vec<u8>,
    chunks: Vec<ChunkRecord>,
}

impl BundleWriter {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm, level: 3, data: Vec::new(), chunks: Vec::new() }
    }

    pub fn add_chunk(&mut self, payload: &[u8]) -> Result<ChunkRecord> {
        let id = chunk_id(payload, self.algorithm)?;
        let compressed = zstd::bulk::compress(payload, self.level)?;
        let record = ChunkRecord {
            id,
            compressed_size: compressed.len() as u32,
            uncompressed_size: payload.len() as u32,
        };
        self.data.extend_from_slice(&compressed);
        self.chunks.push(record);
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn finish(self) -> (Vec<u8>, Vec<ChunkRecord>) {
        (self.data, self.chunks)
    }
}

pub struct PackConfig {
    pub chunk_size: usize,
    pub max_bundle_bytes: usize,
    pub algorithm: HashAlgorithm,
    pub manifest_id: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1 << 20,
            max_bundle_bytes: 16 << 20,
            algorithm: HashAlgorithm::Blake3,
            manifest_id: 1,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackSummary {
    pub manifest_path: PathBuf,
    pub bundle_dir: PathBuf,
    pub files: usize,
    pub chunks: usize,
    pub bundles: usize,
    pub total_bytes: u64,
}

fn build_globset(patterns: &[String], default_all: bool) -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    if patterns.is_empty() && default_all {
        b.add(Glob::new("**/*").map_err(|e| RmanError::format(e.to_string()))?);
    }
    for p in patterns {
        b.add(Glob::new(p).map_err(|e| RmanError::format(format!("glob {p}: {e}")))?);
    }
    b.build().map_err(|e| RmanError::format(e.to_string()))
}

/// Chunk every regular file under `root` into bundles below `output/bundles` and
/// write `output/manifest.rman`. Identical chunks are stored once.
pub fn pack_dir(root: &Path, output: &Path, cfg: &PackConfig) -> Result<PackSummary> {
    let inc = build_globset(&cfg.include, true)?;
    let exc = build_globset(&cfg.exclude, false)?;

    // 1) Discover files, relative to root with `/` separators
    let mut rel_paths: Vec<String> = Vec::new();
    for ent in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let ent = ent.map_err(|e| RmanError::Io(e.into()))?;
        if !ent.file_type().is_file() {
            continue;
        }
        let rel = ent.path().strip_prefix(root).unwrap_or(ent.path());
        let rel = rel.to_string_lossy().replace('\\', "/");
        if inc.is_match(&rel) && !exc.is_match(&rel) {
            rel_paths.push(rel);
        }
    }

    let bundle_dir = output.join("bundles");
    fs::create_dir_all(&bundle_dir)?;

    let mut writer = ManifestWriter::new();
    let param = writer.add_hash_param(cfg.algorithm);
    let mut dir_ids: HashMap<String, u64> = HashMap::new();
    let mut seen_chunks: HashMap<u64, ChunkRecord> = HashMap::new();
    let mut bundle = BundleWriter::new(cfg.algorithm);
    let mut next_bundle_id = 1u64;
    let mut bundles = 0usize;
    let mut total_bytes = 0u64;

    let mut flush = |bundle: BundleWriter, writer: &mut ManifestWriter| -> Result<()> {
        if bundle.is_empty() {
            return Ok(());
        }
        let id = next_bundle_id;
        next_bundle_id += 1;
        let (data, records) = bundle.finish();
        fs::write(bundle_dir.join(Bundle::file_name(id)), data)?;
        writer.add_bundle(id, records);
        bundles += 1;
        Ok(())
    };

    // 2) Chunk, hash, compress
    for (fi, rel) in rel_paths.iter().enumerate() {
        let (dir_path, leaf) = match rel.rsplit_once('/') {
            Some((d, l)) => (Some(d), l),
            None => (None, rel.as_str()),
        };
        let directory_id = match dir_path {
            Some(d) => directory_id(&mut writer, &mut dir_ids, d),
            None => 0,
        };

        let mut f = File::open(root.join(rel))?;
        let size = f.metadata()?.len();
        total_bytes += size;
        let mut chunk_ids = Vec::new();
        let mut buf = vec![0u8; cfg.chunk_size];
        loop {
            let n = read_full(&mut f, &mut buf)?;
            if n == 0 {
                break;
            }
            let id = chunk_id(&buf[..n], cfg.algorithm)?;
            if !seen_chunks.contains_key(&id) {
                if !bundle.is_empty() && bundle.len() + n > cfg.max_bundle_bytes {
                    let full = std::mem::replace(&mut bundle, BundleWriter::new(cfg.algorithm));
                    flush(full, &mut writer)?;
                }
                let record = bundle.add_chunk(&buf[..n])?;
                seen_chunks.insert(id, record);
            }
            chunk_ids.push(id);
        }
        writer.add_file(FileRecord {
            id: fi as u64 + 1,
            directory_id,
            size,
            name: leaf.to_string(),
            language_mask: 0,
            chunk_ids,
            hash_param_index: param,
        });
    }
    flush(bundle, &mut writer)?;
    drop(flush);

    // 3) Container
    let manifest_path = output.join("manifest.rman");
    let mut mf = File::create(&manifest_path)?;
    mf.write_all(&writer.finish(cfg.manifest_id)?)?;

    Ok(PackSummary {
        manifest_path,
        bundle_dir,
        files: rel_paths.len(),
        chunks: seen_chunks.len(),
        bundles,
        total_bytes,
    })
}

/// Id for directory path `d`, registering it and its ancestors on first use.
fn directory_id(writer: &mut ManifestWriter, ids: &mut HashMap<String, u64>, d: &str) -> u64 {
    if let Some(id) = ids.get(d) {
        return *id;
    }
    let (parent, name) = match d.rsplit_once('/') {
        Some((p, n)) => (directory_id(writer, ids, p), n),
        None => (0, d),
    };
    let id = ids.len() as u64 + 1;
    ids.insert(d.to_string(), id);
    writer.add_directory(id, parent, name);
    id
}

fn read_full(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
