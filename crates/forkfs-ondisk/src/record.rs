//! Delta log record codec.
//!
//! Every record is a 24-byte header followed by a type-specific body and an
//! optional trailing payload (name bytes or file data). Decoding produces a
//! tagged [`DeltaRecord`] borrowing payload slices from the log; `total_size`
//! plus the type tag drive all slicing, so a record can never read past its
//! own bounds.

use forkfs_types::{
    DELTA_HEADER_SIZE, InodeNumber, ParseError, ensure_slice, put_bytes, read_le_u16,
    read_le_u32, read_le_u64, u64_to_usize, usize_to_u32, write_le_u16, write_le_u32,
    write_le_u64,
};

pub const DELTA_WRITE: u32 = 1;
pub const DELTA_CREATE: u32 = 2;
pub const DELTA_DELETE: u32 = 3;
pub const DELTA_TRUNCATE: u32 = 4;
pub const DELTA_MKDIR: u32 = 5;
pub const DELTA_RENAME: u32 = 6;
pub const DELTA_SETATTR: u32 = 7;

/// Bits of the SETATTR `valid` mask.
pub const ATTR_MODE: u32 = 1 << 0;
pub const ATTR_UID: u32 = 1 << 1;
pub const ATTR_GID: u32 = 1 << 2;
pub const ATTR_SIZE: u32 = 1 << 3;

const WRITE_BODY: usize = 16;
/// Offset of a WRITE record's data bytes from the record start.
pub const WRITE_DATA_OFFSET: usize = DELTA_HEADER_SIZE + WRITE_BODY;
const CREATE_BODY: usize = 24;
const DELETE_BODY: usize = 16;
const TRUNCATE_BODY: usize = 8;
const RENAME_BODY: usize = 32;
const SETATTR_BODY: usize = 24;

/// Common record header: `type, total_size, ino, timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    pub record_type: u32,
    pub total_size: u32,
    pub ino: InodeNumber,
    pub timestamp: u64,
}

impl DeltaHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            record_type: read_le_u32(bytes, 0)?,
            total_size: read_le_u32(bytes, 4)?,
            ino: InodeNumber(read_le_u64(bytes, 8)?),
            timestamp: read_le_u64(bytes, 16)?,
        })
    }

    fn encode_into(self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(buf, 0, self.record_type)?;
        write_le_u32(buf, 4, self.total_size)?;
        write_le_u64(buf, 8, self.ino.0)?;
        write_le_u64(buf, 16, self.timestamp)?;
        Ok(())
    }
}

/// Decoded record payload. Name and data slices borrow from the log bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaRecord<'a> {
    Write {
        offset: u64,
        flags: u32,
        data: &'a [u8],
    },
    Create {
        parent: InodeNumber,
        new_ino: InodeNumber,
        mode: u32,
        flags: u16,
        name: &'a [u8],
    },
    Mkdir {
        parent: InodeNumber,
        new_ino: InodeNumber,
        mode: u32,
        flags: u16,
        name: &'a [u8],
    },
    Delete {
        parent: InodeNumber,
        flags: u16,
        name: &'a [u8],
    },
    Truncate {
        new_size: u64,
    },
    Rename {
        old_parent: InodeNumber,
        new_parent: InodeNumber,
        ino: InodeNumber,
        old_name: &'a [u8],
        new_name: &'a [u8],
    },
    SetAttr {
        mode: u32,
        uid: u32,
        gid: u32,
        valid: u32,
        size: u64,
    },
}

impl DeltaRecord<'_> {
    #[must_use]
    pub fn record_type(&self) -> u32 {
        match self {
            Self::Write { .. } => DELTA_WRITE,
            Self::Create { .. } => DELTA_CREATE,
            Self::Mkdir { .. } => DELTA_MKDIR,
            Self::Delete { .. } => DELTA_DELETE,
            Self::Truncate { .. } => DELTA_TRUNCATE,
            Self::Rename { .. } => DELTA_RENAME,
            Self::SetAttr { .. } => DELTA_SETATTR,
        }
    }

    /// Total encoded size: header + body + trailing payload.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let tail = match self {
            Self::Write { data, .. } => WRITE_BODY + data.len(),
            Self::Create { name, .. } | Self::Mkdir { name, .. } => CREATE_BODY + name.len(),
            Self::Delete { name, .. } => DELETE_BODY + name.len(),
            Self::Truncate { .. } => TRUNCATE_BODY,
            Self::Rename {
                old_name, new_name, ..
            } => RENAME_BODY + old_name.len() + new_name.len(),
            Self::SetAttr { .. } => SETATTR_BODY,
        };
        DELTA_HEADER_SIZE + tail
    }

    /// Encode the full record (header included) for `ino` at `timestamp`.
    pub fn encode(&self, ino: InodeNumber, timestamp: u64) -> Result<Vec<u8>, ParseError> {
        let total = self.encoded_len();
        let mut buf = vec![0_u8; total];
        DeltaHeader {
            record_type: self.record_type(),
            total_size: usize_to_u32(total, "total_size")?,
            ino,
            timestamp,
        }
        .encode_into(&mut buf)?;

        let body = DELTA_HEADER_SIZE;
        match self {
            Self::Write { offset, flags, data } => {
                write_le_u64(&mut buf, body, *offset)?;
                write_le_u32(&mut buf, body + 8, usize_to_u32(data.len(), "write_len")?)?;
                write_le_u32(&mut buf, body + 12, *flags)?;
                put_bytes(&mut buf, body + WRITE_BODY, data)?;
            }
            Self::Create {
                parent,
                new_ino,
                mode,
                flags,
                name,
            }
            | Self::Mkdir {
                parent,
                new_ino,
                mode,
                flags,
                name,
            } => {
                write_le_u64(&mut buf, body, parent.0)?;
                write_le_u64(&mut buf, body + 8, new_ino.0)?;
                write_le_u32(&mut buf, body + 16, *mode)?;
                write_le_u16(&mut buf, body + 20, name_len_u16(name)?)?;
                write_le_u16(&mut buf, body + 22, *flags)?;
                put_bytes(&mut buf, body + CREATE_BODY, name)?;
            }
            Self::Delete { parent, flags, name } => {
                write_le_u64(&mut buf, body, parent.0)?;
                write_le_u16(&mut buf, body + 8, name_len_u16(name)?)?;
                write_le_u16(&mut buf, body + 10, *flags)?;
                put_bytes(&mut buf, body + DELETE_BODY, name)?;
            }
            Self::Truncate { new_size } => {
                write_le_u64(&mut buf, body, *new_size)?;
            }
            Self::Rename {
                old_parent,
                new_parent,
                ino: renamed,
                old_name,
                new_name,
            } => {
                write_le_u64(&mut buf, body, old_parent.0)?;
                write_le_u64(&mut buf, body + 8, new_parent.0)?;
                write_le_u64(&mut buf, body + 16, renamed.0)?;
                write_le_u16(&mut buf, body + 24, name_len_u16(old_name)?)?;
                write_le_u16(&mut buf, body + 26, name_len_u16(new_name)?)?;
                put_bytes(&mut buf, body + RENAME_BODY, old_name)?;
                put_bytes(&mut buf, body + RENAME_BODY + old_name.len(), new_name)?;
            }
            Self::SetAttr {
                mode,
                uid,
                gid,
                valid,
                size,
            } => {
                write_le_u32(&mut buf, body, *mode)?;
                write_le_u32(&mut buf, body + 4, *uid)?;
                write_le_u32(&mut buf, body + 8, *gid)?;
                write_le_u32(&mut buf, body + 12, *valid)?;
                write_le_u64(&mut buf, body + 16, *size)?;
            }
        }

        Ok(buf)
    }
}

fn name_len_u16(name: &[u8]) -> Result<u16, ParseError> {
    u16::try_from(name.len()).map_err(|_| ParseError::InvalidField {
        field: "name_len",
        reason: "exceeds u16",
    })
}

/// Decode one full record (header + payload) from `bytes`.
///
/// `bytes` must be exactly the record's `total_size` slice; the iterator in
/// [`LogIter`] arranges that.
pub fn decode_record(bytes: &[u8]) -> Result<(DeltaHeader, DeltaRecord<'_>), ParseError> {
    let header = DeltaHeader::parse(bytes)?;
    let total = u64_to_usize(u64::from(header.total_size), "total_size")?;
    if total < DELTA_HEADER_SIZE || total > bytes.len() {
        return Err(ParseError::InvalidField {
            field: "total_size",
            reason: "record overruns its slice",
        });
    }
    let body = &bytes[DELTA_HEADER_SIZE..total];

    let record = match header.record_type {
        DELTA_WRITE => {
            let offset = read_le_u64(body, 0)?;
            let len = u64_to_usize(u64::from(read_le_u32(body, 8)?), "write_len")?;
            let flags = read_le_u32(body, 12)?;
            let data = ensure_slice(body, WRITE_BODY, len)?;
            DeltaRecord::Write { offset, flags, data }
        }
        DELTA_CREATE | DELTA_MKDIR => {
            let parent = InodeNumber(read_le_u64(body, 0)?);
            let new_ino = InodeNumber(read_le_u64(body, 8)?);
            let mode = read_le_u32(body, 16)?;
            let name_len = usize::from(read_le_u16(body, 20)?);
            let flags = read_le_u16(body, 22)?;
            let name = ensure_slice(body, CREATE_BODY, name_len)?;
            if header.record_type == DELTA_CREATE {
                DeltaRecord::Create {
                    parent,
                    new_ino,
                    mode,
                    flags,
                    name,
                }
            } else {
                DeltaRecord::Mkdir {
                    parent,
                    new_ino,
                    mode,
                    flags,
                    name,
                }
            }
        }
        DELTA_DELETE => {
            let parent = InodeNumber(read_le_u64(body, 0)?);
            let name_len = usize::from(read_le_u16(body, 8)?);
            let flags = read_le_u16(body, 10)?;
            let name = ensure_slice(body, DELETE_BODY, name_len)?;
            DeltaRecord::Delete { parent, flags, name }
        }
        DELTA_TRUNCATE => DeltaRecord::Truncate {
            new_size: read_le_u64(body, 0)?,
        },
        DELTA_RENAME => {
            let old_parent = InodeNumber(read_le_u64(body, 0)?);
            let new_parent = InodeNumber(read_le_u64(body, 8)?);
            let ino = InodeNumber(read_le_u64(body, 16)?);
            let old_len = usize::from(read_le_u16(body, 24)?);
            let new_len = usize::from(read_le_u16(body, 26)?);
            let old_name = ensure_slice(body, RENAME_BODY, old_len)?;
            let new_name = ensure_slice(body, RENAME_BODY + old_len, new_len)?;
            DeltaRecord::Rename {
                old_parent,
                new_parent,
                ino,
                old_name,
                new_name,
            }
        }
        DELTA_SETATTR => DeltaRecord::SetAttr {
            mode: read_le_u32(body, 0)?,
            uid: read_le_u32(body, 4)?,
            gid: read_le_u32(body, 8)?,
            valid: read_le_u32(body, 12)?,
            size: read_le_u64(body, 16)?,
        },
        other => return Err(ParseError::UnknownRecordType(other)),
    };

    Ok((header, record))
}

/// One record yielded during a log scan.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    /// Offset of this record relative to the start of the branch's log.
    pub offset: u64,
    pub header: DeltaHeader,
    /// `None` for records whose type tag this version does not understand;
    /// `total_size` still lets the scan skip them.
    pub record: Option<DeltaRecord<'a>>,
}

/// Iterator over the densely packed records of one branch's log bytes.
///
/// Terminates at the first record with `total_size == 0` (end-of-log marker)
/// or at the end of the slice. A record whose `total_size` would overrun the
/// slice yields an error and ends the scan.
pub struct LogIter<'a> {
    log: &'a [u8],
    pos: usize,
}

impl<'a> LogIter<'a> {
    #[must_use]
    pub fn new(log: &'a [u8]) -> Self {
        Self { log, pos: 0 }
    }
}

impl<'a> Iterator for LogIter<'a> {
    type Item = Result<LogEntry<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + DELTA_HEADER_SIZE > self.log.len() {
            return None;
        }
        let header = match DeltaHeader::parse(&self.log[self.pos..]) {
            Ok(header) => header,
            Err(err) => return Some(Err(err)),
        };
        if header.total_size == 0 {
            return None;
        }
        let total = match u64_to_usize(u64::from(header.total_size), "total_size") {
            Ok(total) => total,
            Err(err) => return Some(Err(err)),
        };
        if total < DELTA_HEADER_SIZE || self.pos + total > self.log.len() {
            self.pos = self.log.len();
            return Some(Err(ParseError::InvalidField {
                field: "total_size",
                reason: "record overruns log",
            }));
        }

        let offset = u64::try_from(self.pos).unwrap_or(u64::MAX);
        let slice = &self.log[self.pos..self.pos + total];
        self.pos += total;

        match decode_record(slice) {
            Ok((header, record)) => Some(Ok(LogEntry {
                offset,
                header,
                record: Some(record),
            })),
            Err(ParseError::UnknownRecordType(_)) => Some(Ok(LogEntry {
                offset,
                header,
                record: None,
            })),
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(record: DeltaRecord<'_>, ino: InodeNumber) {
        let encoded = record.encode(ino, 42).expect("encode");
        assert_eq!(encoded.len(), record.encoded_len());
        let (header, decoded) = decode_record(&encoded).expect("decode");
        assert_eq!(header.record_type, record.record_type());
        assert_eq!(header.ino, ino);
        assert_eq!(header.timestamp, 42);
        assert_eq!(usize::try_from(header.total_size).unwrap(), encoded.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn write_round_trip() {
        round_trip(
            DeltaRecord::Write {
                offset: 512,
                flags: 0,
                data: b"payload bytes",
            },
            InodeNumber(9),
        );
    }

    #[test]
    fn create_and_mkdir_round_trip() {
        round_trip(
            DeltaRecord::Create {
                parent: InodeNumber(1),
                new_ino: InodeNumber(12),
                mode: 0o100_644,
                flags: 0,
                name: b"a.txt",
            },
            InodeNumber(12),
        );
        round_trip(
            DeltaRecord::Mkdir {
                parent: InodeNumber(1),
                new_ino: InodeNumber(13),
                mode: 0o040_755,
                flags: 0,
                name: b"subdir",
            },
            InodeNumber(13),
        );
    }

    #[test]
    fn delete_truncate_setattr_round_trip() {
        round_trip(
            DeltaRecord::Delete {
                parent: InodeNumber(1),
                flags: 0,
                name: b"victim",
            },
            InodeNumber(5),
        );
        round_trip(DeltaRecord::Truncate { new_size: 100 }, InodeNumber(5));
        round_trip(
            DeltaRecord::SetAttr {
                mode: 0o100_600,
                uid: 1000,
                gid: 1000,
                valid: ATTR_MODE | ATTR_UID | ATTR_GID,
                size: 0,
            },
            InodeNumber(5),
        );
    }

    #[test]
    fn rename_round_trip() {
        round_trip(
            DeltaRecord::Rename {
                old_parent: InodeNumber(1),
                new_parent: InodeNumber(2),
                ino: InodeNumber(7),
                old_name: b"foo",
                new_name: b"bar-renamed",
            },
            InodeNumber(7),
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut encoded = DeltaRecord::Truncate { new_size: 0 }
            .encode(InodeNumber(1), 0)
            .unwrap();
        encoded[0] = 200;
        assert_eq!(
            decode_record(&encoded),
            Err(ParseError::UnknownRecordType(200))
        );
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let encoded = DeltaRecord::Write {
            offset: 0,
            flags: 0,
            data: b"0123456789",
        }
        .encode(InodeNumber(1), 0)
        .unwrap();
        // Claim a larger data length than the record carries.
        let mut bad = encoded;
        write_le_u32(&mut bad, DELTA_HEADER_SIZE + 8, 1_000).unwrap();
        assert!(decode_record(&bad).is_err());
    }

    #[test]
    fn log_iter_walks_dense_records_and_stops_at_zero() {
        let mut log = Vec::new();
        log.extend(
            DeltaRecord::Create {
                parent: InodeNumber(1),
                new_ino: InodeNumber(2),
                mode: 0o100_644,
                flags: 0,
                name: b"f",
            }
            .encode(InodeNumber(2), 1)
            .unwrap(),
        );
        let second_offset = u64::try_from(log.len()).unwrap();
        log.extend(
            DeltaRecord::Write {
                offset: 0,
                flags: 0,
                data: b"xyz",
            }
            .encode(InodeNumber(2), 2)
            .unwrap(),
        );
        // Zeroed tail terminates the scan.
        log.extend(vec![0_u8; 64]);

        let entries: Vec<_> = LogIter::new(&log).collect::<Result<_, _>>().expect("scan");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].offset, second_offset);
        assert!(matches!(
            entries[1].record,
            Some(DeltaRecord::Write { data: b"xyz", .. })
        ));
    }

    #[test]
    fn log_iter_skips_unknown_types() {
        let mut log = DeltaRecord::Truncate { new_size: 7 }
            .encode(InodeNumber(3), 0)
            .unwrap();
        log[0] = 99; // unknown tag, size intact
        log.extend(
            DeltaRecord::Truncate { new_size: 8 }
                .encode(InodeNumber(3), 1)
                .unwrap(),
        );

        let entries: Vec<_> = LogIter::new(&log).collect::<Result<_, _>>().expect("scan");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].record.is_none());
        assert!(matches!(
            entries[1].record,
            Some(DeltaRecord::Truncate { new_size: 8 })
        ));
    }

    #[test]
    fn log_iter_reports_overrun() {
        let mut log = DeltaRecord::Truncate { new_size: 7 }
            .encode(InodeNumber(3), 0)
            .unwrap();
        // Inflate total_size past the buffer.
        write_le_u32(&mut log, 4, 4096).unwrap();
        let result: Result<Vec<_>, _> = LogIter::new(&log).collect();
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn write_record_round_trips(offset in 0_u64..1 << 40, data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let record = DeltaRecord::Write { offset, flags: 0, data: &data };
            let encoded = record.encode(InodeNumber(11), 3).unwrap();
            let (header, decoded) = decode_record(&encoded).unwrap();
            prop_assert_eq!(header.ino, InodeNumber(11));
            prop_assert_eq!(decoded, record);
        }

        #[test]
        fn decoder_never_panics_on_noise(noise in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_record(&noise);
            for entry in LogIter::new(&noise) {
                if entry.is_err() {
                    break;
                }
            }
        }
    }
}
