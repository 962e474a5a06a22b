//! Binary TAR index: 16 bytes per regular-file entry, in TAR order. See
//! the header layout table in the component design — this module is the
//! sole place that understands it.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const RECORD_LEN: usize = 16;
const BLOCK_LEN: usize = 512;
const HEADER_NAME_LEN: usize = 100;
const HEADER_SIZE_OFFSET: usize = 124;
const HEADER_SIZE_LEN: usize = 12;
const HEADER_TYPEFLAG_OFFSET: usize = 156;
const GNU_LONGNAME_TYPEFLAG: u8 = b'L';

/// One decoded index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub header_offset: u64,
    pub header_blocks: u16,
    pub size: u64,
}

impl Entry {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_offset.to_be_bytes());
        out.extend_from_slice(&self.header_blocks.to_be_bytes());
        // u48 big-endian: the top two bytes of a u64 are dropped.
        out.extend_from_slice(&self.size.to_be_bytes()[2..8]);
    }

    fn decode(raw: &[u8; RECORD_LEN]) -> Self {
        let header_offset = u64::from_be_bytes(raw[0..8].try_into().unwrap());
        let header_blocks = u16::from_be_bytes(raw[8..10].try_into().unwrap());
        let mut size_buf = [0u8; 8];
        size_buf[2..8].copy_from_slice(&raw[10..16]);
        let size = u64::from_be_bytes(size_buf);
        Entry { header_offset, header_blocks, size }
    }

    /// Inclusive byte range of the entry's payload, padding excluded. For
    /// a zero-size entry the range is empty (`end < start`).
    pub fn payload_range(&self) -> (u64, u64) {
        let start = self.header_offset + BLOCK_LEN as u64 * self.header_blocks as u64;
        if self.size == 0 {
            return (start, start.wrapping_sub(1));
        }
        (start, start + self.size - 1)
    }

    /// The offset one past this entry's final padded block — where the
    /// next entry's header (or the archive trailer) begins.
    pub fn next_offset(&self) -> u64 {
        let payload_start = self.header_offset + BLOCK_LEN as u64 * self.header_blocks as u64;
        payload_start + round_up_block(self.size)
    }

    /// `header_offset + header_blocks` through the end of the payload's
    /// block padding (but excluding the archive's 2x512 trailer). This is
    /// exactly the byte span the download planner and the aggregation
    /// engine presign for this entry.
    pub fn padded_span(&self) -> (u64, u64) {
        let payload_start = self.header_offset + BLOCK_LEN as u64 * self.header_blocks as u64;
        let end = payload_start + round_up_block(self.size);
        (self.header_offset, end.saturating_sub(1))
    }
}

fn round_up_block(size: u64) -> u64 {
    (size + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64 * BLOCK_LEN as u64
}

/// `EntryCount(index_bytes) -> n`
pub fn entry_count(index_bytes: &[u8]) -> Result<usize> {
    if index_bytes.len() % RECORD_LEN != 0 {
        return Err(Error::InvalidPayload(format!(
            "index length {} is not a multiple of {RECORD_LEN}",
            index_bytes.len()
        )));
    }
    Ok(index_bytes.len() / RECORD_LEN)
}

/// `Lookup(index_bytes, i) -> entry`: random access, no decoding of
/// intermediate entries.
pub fn lookup(index_bytes: &[u8], i: usize) -> Result<Entry> {
    let start = i * RECORD_LEN;
    let end = start + RECORD_LEN;
    let raw = index_bytes
        .get(start..end)
        .ok_or_else(|| Error::InvalidPayload(format!("index entry {i} out of bounds")))?;
    let raw: [u8; RECORD_LEN] = raw.try_into().unwrap();
    Ok(Entry::decode(&raw))
}

pub fn encode_all(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * RECORD_LEN);
    for e in entries {
        e.encode(&mut out);
    }
    out
}

/// The datapoint key parsed from a TAR member's filename, per the
/// `printf("%020d", key) + "." + extension` convention.
fn parse_datapoint_key(name: &str) -> Result<u64> {
    let dot = name.find('.').ok_or_else(|| Error::InvalidPayload(format!("entry name {name:?} has no extension")))?;
    let (digits, ext) = name.split_at(dot);
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPayload(format!("entry name {name:?} does not match ^\\d{{20}}\\.")));
    }
    if ext.len() <= 1 || ext[1..].contains('/') {
        return Err(Error::InvalidPayload(format!("entry name {name:?} has an invalid extension")));
    }
    digits
        .parse::<u64>()
        .map_err(|e| Error::InvalidPayload(format!("entry name {name:?} key overflow: {e}")))
}

fn parse_octal_size(field: &[u8]) -> Result<u64> {
    let text = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .collect::<Vec<_>>();
    let text: String = text.iter().map(|&&b| b as char).collect();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(&text, 8).map_err(|e| Error::InvalidPayload(format!("malformed octal size field: {e}")))
}

fn parse_name(field: &[u8; HEADER_NAME_LEN]) -> Result<String> {
    let len = field.iter().position(|&b| b == 0).unwrap_or(HEADER_NAME_LEN);
    std::str::from_utf8(&field[..len])
        .map(|s| s.to_owned())
        .map_err(|e| Error::InvalidPayload(format!("non-utf8 entry name: {e}")))
}

fn is_zero_block(block: &[u8; BLOCK_LEN]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// `Index(tar_reader) -> index_bytes`. Streams the TAR exactly once,
/// emitting one record per regular-file entry, in TAR order.
///
/// When `first_datapoint_index` is `Some`, upload-validation mode is
/// active: every filename must match `^\d{20}\.[^/]+$` and decode to a
/// strictly increasing sequence of keys starting there.
pub async fn build<R: AsyncRead + Unpin>(mut reader: R, first_datapoint_index: Option<u64>) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    let mut offset: u64 = 0;
    let mut expected_next_key = first_datapoint_index;

    loop {
        let mut block = [0u8; BLOCK_LEN];
        match read_block(&mut reader, &mut block).await? {
            None => break, // clean EOF at a block boundary: truncated archive, treat as end
            Some(()) => {}
        }

        if is_zero_block(&block) {
            break;
        }

        let mut name = parse_name(&block[0..HEADER_NAME_LEN].try_into().unwrap())?;
        let typeflag = block[HEADER_TYPEFLAG_OFFSET];
        let mut size = parse_octal_size(&block[HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + HEADER_SIZE_LEN])?;
        let header_start = offset;
        let mut header_blocks: u16 = 1;
        offset += BLOCK_LEN as u64;

        if typeflag == GNU_LONGNAME_TYPEFLAG {
            let data_blocks = round_up_block(size) / BLOCK_LEN as u64;
            let mut longname = Vec::with_capacity(size as usize);
            for _ in 0..data_blocks {
                let mut data_block = [0u8; BLOCK_LEN];
                read_block(&mut reader, &mut data_block)
                    .await?
                    .ok_or_else(|| Error::InvalidPayload("truncated GNU long-name data".to_owned()))?;
                longname.extend_from_slice(&data_block);
                offset += BLOCK_LEN as u64;
                header_blocks += 1;
            }
            longname.truncate(size as usize);
            let end = longname.iter().position(|&b| b == 0).unwrap_or(longname.len());
            name = String::from_utf8(longname[..end].to_vec())
                .map_err(|e| Error::InvalidPayload(format!("non-utf8 long name: {e}")))?;

            let mut real_header = [0u8; BLOCK_LEN];
            read_block(&mut reader, &mut real_header)
                .await?
                .ok_or_else(|| Error::InvalidPayload("truncated header after GNU long-name entry".to_owned()))?;
            offset += BLOCK_LEN as u64;
            header_blocks += 1;
            size = parse_octal_size(&real_header[HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + HEADER_SIZE_LEN])?;
        } else if typeflag != b'0' && typeflag != 0 {
            // Non-regular entry (directory, link, pax header, ...): no
            // index record, but still occupies TAR space.
            skip_payload(&mut reader, size).await?;
            offset += round_up_block(size);
            continue;
        }

        if let Some(expected) = expected_next_key {
            let key = parse_datapoint_key(&name)?;
            if key != expected {
                return Err(Error::InvalidPayload(format!(
                    "entry {name:?} decodes to key {key}, expected {expected}"
                )));
            }
            expected_next_key = Some(expected + 1);
        }

        entries.push(Entry { header_offset: header_start, header_blocks, size });
        skip_payload(&mut reader, size).await?;
        offset += round_up_block(size);
    }

    Ok(encode_all(&entries))
}

async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, block: &mut [u8; BLOCK_LEN]) -> Result<Option<()>> {
    let mut filled = 0;
    while filled < BLOCK_LEN {
        let n = reader
            .read(&mut block[filled..])
            .await
            .map_err(|e| Error::InvalidPayload(format!("error reading TAR stream: {e}")))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::InvalidPayload("TAR stream truncated mid-block".to_owned()));
        }
        filled += n;
    }
    Ok(Some(()))
}

async fn skip_payload<R: AsyncRead + Unpin>(reader: &mut R, size: u64) -> Result<()> {
    let padded = round_up_block(size);
    let mut remaining = padded;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| Error::InvalidPayload(format!("error reading TAR payload: {e}")))?;
        if n == 0 {
            return Err(Error::InvalidPayload("TAR stream truncated mid-payload".to_owned()));
        }
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_header(name: &str, size: u64) -> [u8; BLOCK_LEN] {
        let mut block = [0u8; BLOCK_LEN];
        block[0..name.len()].copy_from_slice(name.as_bytes());
        let size_str = format!("{size:011o}\0");
        block[HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + size_str.len()].copy_from_slice(size_str.as_bytes());
        block[HEADER_TYPEFLAG_OFFSET] = b'0';
        block
    }

    fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in entries {
            out.extend_from_slice(&make_header(name, data.len() as u64));
            out.extend_from_slice(data);
            let pad = round_up_block(data.len() as u64) as usize - data.len();
            out.extend(std::iter::repeat(0u8).take(pad));
        }
        out.extend(std::iter::repeat(0u8).take(BLOCK_LEN * 2));
        out
    }

    #[tokio::test]
    async fn builds_and_looks_up_entries() {
        let tar = make_tar(&[
            ("00000000000000000000.bin", b"hello"),
            ("00000000000000000001.bin", b"world!"),
        ]);
        let index = build(Cursor::new(tar.clone()), Some(0)).await.unwrap();
        assert_eq!(entry_count(&index).unwrap(), 2);

        let e0 = lookup(&index, 0).unwrap();
        let (s, e) = e0.payload_range();
        assert_eq!(&tar[s as usize..=e as usize], b"hello");

        let e1 = lookup(&index, 1).unwrap();
        let (s, e) = e1.payload_range();
        assert_eq!(&tar[s as usize..=e as usize], b"world!");
    }

    #[tokio::test]
    async fn rejects_non_contiguous_keys() {
        let tar = make_tar(&[("00000000000000000000.bin", b"a"), ("00000000000000000002.bin", b"b")]);
        let err = build(Cursor::new(tar), Some(0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_name() {
        let tar = make_tar(&[("not-a-datapoint.bin", b"a")]);
        let err = build(Cursor::new(tar), Some(0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
    }

    #[test]
    fn entry_count_rejects_misaligned_length() {
        assert!(entry_count(&[0u8; 15]).is_err());
        assert!(entry_count(&[0u8; 32]).is_ok());
    }

    #[tokio::test]
    async fn handles_gnu_long_name_entries() {
        let long_name = "00000000000000000003.extremely-long-extension-segment";
        let mut tar = Vec::new();
        let mut longlink_header = [0u8; BLOCK_LEN];
        longlink_header[0..13].copy_from_slice(b"././@LongLink");
        let size_str = format!("{:011o}\0", long_name.len());
        longlink_header[HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + size_str.len()].copy_from_slice(size_str.as_bytes());
        longlink_header[HEADER_TYPEFLAG_OFFSET] = GNU_LONGNAME_TYPEFLAG;
        tar.extend_from_slice(&longlink_header);
        let mut data = long_name.as_bytes().to_vec();
        let pad = round_up_block(data.len() as u64) as usize - data.len();
        data.extend(std::iter::repeat(0u8).take(pad));
        tar.extend_from_slice(&data);
        tar.extend_from_slice(&make_header("truncated-name-ignored", 4));
        tar.extend_from_slice(b"abcd");
        tar.extend(std::iter::repeat(0u8).take(BLOCK_LEN * 2));

        let index = build(Cursor::new(tar.clone()), Some(3)).await.unwrap();
        assert_eq!(entry_count(&index).unwrap(), 1);
        let e = lookup(&index, 0).unwrap();
        assert_eq!(e.header_blocks, 3);
        let (s, end) = e.payload_range();
        assert_eq!(&tar[s as usize..=end as usize], b"abcd");
    }
}
