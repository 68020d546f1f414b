//! Packfile container
//!
//! A packfile is a flat run of records
//! `<40 hex id><8-digit decimal length><payload bytes>\n`; it is deflated as
//! a whole when sent. A prepfile (`"<hash> <kind>\n"` lines) selects the
//! objects that go into an outgoing packfile.

use std::collections::HashSet;

use crate::error::{Result, StashError};
use crate::object::{OBJECT_ID_HEX_LEN, ObjectId, ObjectKind};
use crate::store::ObjectStore;

const LENGTH_DIGITS: usize = 8;

/// Largest payload an 8-digit length field can describe
pub const MAX_RECORD_LEN: usize = 99_999_999;

/// Ordered, de-duplicated selection of objects to pack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prepfile {
    entries: Vec<(ObjectId, ObjectKind)>,
    seen: HashSet<ObjectId>,
}

impl Prepfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object; returns false if it was already selected
    pub fn push(&mut self, id: ObjectId, kind: ObjectKind) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.entries.push((id, kind));
        true
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, ObjectKind)> {
        self.entries.iter()
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(id, kind)| format!("{} {}\n", id, kind))
            .collect()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut prepfile = Self::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (id, kind) = line
                .split_once(' ')
                .ok_or_else(|| StashError::MalformedObject(format!("invalid prepfile line {:?}", line)))?;
            prepfile.push(id.parse()?, kind.trim().parse()?);
        }
        Ok(prepfile)
    }
}

/// Builds packfile records
#[derive(Debug, Default)]
pub struct PackWriter {
    buf: Vec<u8>,
    count: usize,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record
    pub fn add_object(&mut self, id: &ObjectId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(StashError::InvalidArgument(format!(
                "object {} is too large to pack ({} bytes)",
                id,
                payload.len()
            )));
        }
        self.buf.extend_from_slice(id.to_hex().as_bytes());
        self.buf.extend_from_slice(format!("{:08}", payload.len()).as_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.push(b'\n');
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The raw (uncompressed) record stream
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Pack every object a prepfile selects, reading payloads from `store`
pub fn build_packfile(store: &ObjectStore, prepfile: &Prepfile) -> Result<Vec<u8>> {
    let mut writer = PackWriter::new();
    for (id, _) in prepfile.iter() {
        writer.add_object(id, &store.get(id)?)?;
    }
    tracing::debug!("packed {} objects", writer.len());
    Ok(writer.finish())
}

/// Sequential record parser using the fixed-width fields
pub struct PackReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                StashError::MalformedObject(format!("packfile truncated in {} at offset {}", what, self.pos))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_record(&mut self) -> Result<(ObjectId, &'a [u8])> {
        let id_field = self.take(OBJECT_ID_HEX_LEN, "object id")?;
        let id = std::str::from_utf8(id_field)
            .map_err(|_| StashError::MalformedObject("packfile id is not ASCII".into()))
            .and_then(ObjectId::from_hex)?;

        let len_field = self.take(LENGTH_DIGITS, "length")?;
        if !len_field.iter().all(u8::is_ascii_digit) {
            return Err(StashError::MalformedObject(format!("invalid record length {:?}", len_field)));
        }
        let len = len_field.iter().fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize);

        let payload = self.take(len, "payload")?;
        if self.take(1, "record terminator")? != b"\n" {
            return Err(StashError::MalformedObject(format!("record {} is not newline terminated", id)));
        }
        Ok((id, payload))
    }
}

impl<'a> Iterator for PackReader<'a> {
    type Item = Result<(ObjectId, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let record = self.next_record();
        if record.is_err() {
            self.pos = self.data.len();
        }
        Some(record)
    }
}

/// Outcome of [`execute_packfile`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    pub written: usize,
    pub skipped: usize,
}

/// Store every record of a packfile. The whole pack is parsed before
/// anything is written; each payload must hash to its record id. Objects
/// already present are skipped.
pub fn execute_packfile(store: &ObjectStore, data: &[u8]) -> Result<PackStats> {
    let records = PackReader::new(data).collect::<Result<Vec<_>>>()?;
    let mut stats = PackStats::default();
    for (id, payload) in records {
        if store.insert(&id, payload)? {
            stats.written += 1;
        } else {
            stats.skipped += 1;
        }
    }
    tracing::debug!("executed packfile: {} written, {} skipped", stats.written, stats.skipped);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_layout() {
        let id = ObjectId::compute(ObjectKind::Blob, b"hi");
        let mut writer = PackWriter::new();
        writer.add_object(&id, b"hi").unwrap();
        let expected = format!("{}00000002hi\n", id.to_hex());
        assert_eq!(writer.finish(), expected.into_bytes());
    }

    #[test]
    fn test_execute_with_existing_objects() {
        let source_dir = TempDir::new().unwrap();
        let target_dir = TempDir::new().unwrap();
        let source = ObjectStore::new(source_dir.path());
        let target = ObjectStore::new(target_dir.path());

        let mut prepfile = Prepfile::new();
        let mut ids = Vec::new();
        for payload in [&b"one"[..], b"two\nlines", b"", b"three"] {
            let id = source.put(ObjectKind::Blob, payload).unwrap();
            prepfile.push(id, ObjectKind::Blob);
            ids.push(id);
        }
        target.put(ObjectKind::Blob, b"two\nlines").unwrap();

        let pack = build_packfile(&source, &prepfile).unwrap();
        let stats = execute_packfile(&target, &pack).unwrap();
        assert_eq!(stats, PackStats { written: 3, skipped: 1 });
        for id in &ids {
            assert_eq!(target.get(id).unwrap(), source.get(id).unwrap());
        }

        let again = execute_packfile(&target, &pack).unwrap();
        assert_eq!(again, PackStats { written: 0, skipped: 4 });
    }

    #[test]
    fn test_truncated_pack_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let id = ObjectId::compute(ObjectKind::Blob, b"payload");
        let mut writer = PackWriter::new();
        writer.add_object(&id, b"payload").unwrap();
        let mut pack = writer.finish();
        pack.extend_from_slice(&pack.clone()[..45]);

        assert!(matches!(execute_packfile(&store, &pack), Err(StashError::MalformedObject(_))));
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_record_with_wrong_id_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        let mut writer = PackWriter::new();
        writer.add_object(&ObjectId::new([1; 20]), b"payload").unwrap();
        assert!(execute_packfile(&store, &writer.finish()).is_err());
    }

    #[test]
    fn test_empty_pack() {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::new(tmp.path());
        assert_eq!(execute_packfile(&store, b"").unwrap(), PackStats::default());
    }

    #[test]
    fn test_prepfile_render_parse() {
        let mut prepfile = Prepfile::new();
        let a = ObjectId::new([1; 20]);
        assert!(prepfile.push(a, ObjectKind::Commit));
        assert!(!prepfile.push(a, ObjectKind::Commit));
        prepfile.push(ObjectId::new([2; 20]), ObjectKind::Tree);
        let text = prepfile.render();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with(&format!("{} commit\n", a)));
        assert_eq!(Prepfile::parse(&text).unwrap(), prepfile);
    }
}
