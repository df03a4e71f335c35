// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sources of H.264 access units.
//!
//! The decoder is fed one access unit per OUTPUT buffer, in Annex-B format (start code
//! delimited). Raw `.h264` elementary streams are split into access units by looking at NAL unit
//! types, and Matroska files have their length-prefixed samples rewritten as Annex-B.

use std::borrow::Cow;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::ops::Range;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use bytes::Buf;
use enumn::N;
use matroska_demuxer::Frame;
use matroska_demuxer::MatroskaFile;
use matroska_demuxer::TrackType;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];

/// Something producing compressed access units, one per call, until the end of the stream.
pub trait UnitSource {
    /// Returns the next access unit, or `None` once the stream is exhausted.
    fn next_unit(&mut self) -> Result<Option<Cow<'_, [u8]>>>;
}

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    fn is_vcl(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }
}

#[derive(Debug)]
struct NalHeader {
    /// Offset of the start code, including the leading zero byte of 4-byte start codes.
    sc_offset: usize,
    /// Offset of the NAL header byte.
    offset: usize,
    nalu_type: NaluType,
    /// `first_mb_in_slice` is 0. Only meaningful for slices.
    first_mb_zero: bool,
}

impl NalHeader {
    /// Whether this NAL unit opens a new access unit, given that the current access unit already
    /// contains a slice or not.
    fn starts_access_unit(&self, seen_vcl: bool) -> bool {
        match self.nalu_type {
            NaluType::AuDelimiter => true,
            NaluType::Sps | NaluType::Pps | NaluType::Sei => seen_vcl,
            t if t.is_vcl() => seen_vcl && self.first_mb_zero,
            _ => false,
        }
    }
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])
        .map(|pos| from + pos)
}

/// Finds the first NAL unit starting at or after `from`.
fn next_nal(data: &[u8], from: usize) -> Option<NalHeader> {
    let start_code = find_start_code(data, from)?;
    let offset = start_code + 3;
    let header = *data.get(offset)?;

    // 00 00 00 01: the first zero is the zero_byte of the start code.
    let sc_offset = if start_code > from && data[start_code - 1] == 0 {
        start_code - 1
    } else {
        start_code
    };

    Some(NalHeader {
        sc_offset,
        offset,
        nalu_type: NaluType::n(header & 0x1f).unwrap_or(NaluType::Unknown),
        // first_mb_in_slice is ue(v) coded, and 0 is encoded as a single 1 bit.
        first_mb_zero: data.get(offset + 1).is_some_and(|b| b & 0x80 != 0),
    })
}

/// Splits an Annex-B H.264 byte stream into access units.
///
/// Each returned unit starts with a start code and extends up to the start code of the next
/// unit. Bytes before the first start code are skipped.
pub struct AnnexBAccessUnits<T: AsRef<[u8]>> {
    data: T,
    pos: usize,
}

impl<T: AsRef<[u8]>> AnnexBAccessUnits<T> {
    pub fn new(data: T) -> Self {
        Self { data, pos: 0 }
    }

    fn next_range(&mut self) -> Option<Range<usize>> {
        let data = self.data.as_ref();

        let first = next_nal(data, self.pos)?;
        let start = first.sc_offset;
        let mut seen_vcl = first.nalu_type.is_vcl();
        let mut cursor = first.offset + 1;

        while let Some(nal) = next_nal(data, cursor) {
            if nal.starts_access_unit(seen_vcl) {
                self.pos = nal.sc_offset;
                return Some(start..nal.sc_offset);
            }

            seen_vcl |= nal.nalu_type.is_vcl();
            cursor = nal.offset + 1;
        }

        self.pos = data.len();
        Some(start..data.len())
    }
}

impl<'a> Iterator for AnnexBAccessUnits<&'a [u8]> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.next_range()?;
        let data: &'a [u8] = self.data;
        Some(&data[range])
    }
}

impl<T: AsRef<[u8]>> UnitSource for AnnexBAccessUnits<T> {
    fn next_unit(&mut self) -> Result<Option<Cow<'_, [u8]>>> {
        Ok(self
            .next_range()
            .map(|range| Cow::Borrowed(&self.data.as_ref()[range])))
    }
}

/// Parameter sets and NAL length size from an `AVCDecoderConfigurationRecord`.
#[derive(Debug, Default, PartialEq, Eq)]
struct AvcConfig {
    nal_length_size: usize,
    /// SPS and PPS, each with a start code.
    parameter_sets: Vec<u8>,
}

impl AvcConfig {
    fn parse(mut record: &[u8]) -> Result<Self> {
        if record.remaining() < 6 {
            return Err(anyhow!("AVC configuration record too short"));
        }

        let version = record.get_u8();
        if version != 1 {
            return Err(anyhow!("unsupported AVC configuration version {}", version));
        }
        // profile, profile compatibility, level.
        record.advance(3);
        let nal_length_size = (record.get_u8() & 0x3) as usize + 1;

        let mut parameter_sets = Vec::new();
        let num_sps = record.get_u8() & 0x1f;
        Self::read_parameter_sets(&mut record, num_sps, &mut parameter_sets)?;
        if record.has_remaining() {
            let num_pps = record.get_u8();
            Self::read_parameter_sets(&mut record, num_pps, &mut parameter_sets)?;
        }

        Ok(Self {
            nal_length_size,
            parameter_sets,
        })
    }

    fn read_parameter_sets(record: &mut &[u8], count: u8, out: &mut Vec<u8>) -> Result<()> {
        for _ in 0..count {
            if record.remaining() < 2 {
                return Err(anyhow!("truncated parameter set length"));
            }
            let len = record.get_u16() as usize;
            if record.remaining() < len {
                return Err(anyhow!("truncated parameter set"));
            }

            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(&record[..len]);
            record.advance(len);
        }

        Ok(())
    }
}

/// Rewrites a sample made of length-prefixed NAL units as Annex-B.
fn avcc_to_annexb(mut sample: &[u8], nal_length_size: usize, out: &mut Vec<u8>) -> Result<()> {
    while sample.has_remaining() {
        if sample.remaining() < nal_length_size {
            return Err(anyhow!("truncated NAL unit length"));
        }
        let len = sample.get_uint(nal_length_size) as usize;
        if sample.remaining() < len {
            return Err(anyhow!(
                "NAL unit of {} bytes overruns its sample ({} bytes left)",
                len,
                sample.remaining()
            ));
        }

        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&sample[..len]);
        sample.advance(len);
    }

    Ok(())
}

/// Reads the H.264 video track of a Matroska file.
pub struct MkvAccessUnits<R: Read + Seek> {
    input: MatroskaFile<R>,
    video_track: u64,
    config: AvcConfig,
    /// Parameter sets not sent yet. They go in front of the first unit.
    pending_parameter_sets: bool,
}

impl<R: Read + Seek> MkvAccessUnits<R> {
    pub fn new(input: R) -> Result<Self> {
        let input = MatroskaFile::open(input)?;
        let track = input
            .tracks()
            .iter()
            .find(|t| t.track_type() == TrackType::Video)
            .ok_or_else(|| anyhow!("no video track in input file"))?;

        if !track.codec_id().starts_with("V_MPEG4/ISO/AVC") {
            return Err(anyhow!("unsupported video codec {}", track.codec_id()));
        }
        let config = AvcConfig::parse(
            track
                .codec_private()
                .ok_or_else(|| anyhow!("H.264 track without codec private data"))?,
        )?;
        let video_track = track.track_number().get();

        log::debug!(
            "MKV: H.264 track {}, NAL length size {}, {} bytes of parameter sets",
            video_track,
            config.nal_length_size,
            config.parameter_sets.len()
        );

        Ok(Self {
            input,
            video_track,
            config,
            pending_parameter_sets: true,
        })
    }
}

impl<R: Read + Seek> UnitSource for MkvAccessUnits<R> {
    fn next_unit(&mut self) -> Result<Option<Cow<'_, [u8]>>> {
        let mut frame = Frame::default();

        while self.input.next_frame(&mut frame)? {
            if frame.track != self.video_track {
                continue;
            }

            let mut unit = Vec::with_capacity(frame.data.len() + self.config.parameter_sets.len());
            if std::mem::take(&mut self.pending_parameter_sets) {
                unit.extend_from_slice(&self.config.parameter_sets);
            }
            avcc_to_annexb(&frame.data, self.config.nal_length_size, &mut unit)?;

            return Ok(Some(Cow::Owned(unit)));
        }

        Ok(None)
    }
}

/// Opens `path` as a source of access units. `.mkv` and `.webm` files, or files starting with the
/// EBML magic, are demuxed as Matroska. Anything else is read as an Annex-B elementary stream.
pub fn open_source(path: &Path) -> Result<Box<dyn UnitSource>> {
    let is_mkv_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mkv") || ext.eq_ignore_ascii_case("webm"));

    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    if is_mkv_extension {
        log::info!("Reading {} as Matroska", path.display());
        return Ok(Box::new(MkvAccessUnits::new(BufReader::new(file))?));
    }

    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .with_context(|| format!("failed to read {}", path.display()))?;

    if data.starts_with(&EBML_MAGIC) {
        log::info!("Reading {} as Matroska", path.display());
        return Ok(Box::new(MkvAccessUnits::new(std::io::Cursor::new(data))?));
    }

    log::info!(
        "Reading {} as an Annex-B stream of {} bytes",
        path.display(),
        data.len()
    );
    Ok(Box::new(AnnexBAccessUnits::new(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    /// first_mb_in_slice == 0
    const P_FIRST: &[u8] = &[0, 0, 1, 0x41, 0x9a, 0x02];
    /// first_mb_in_slice != 0
    const P_SECOND: &[u8] = &[0, 0, 1, 0x41, 0x40, 0x12];

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn splits_on_first_slice() {
        let data = stream(&[SPS, PPS, IDR, P_FIRST, P_SECOND, P_FIRST]);
        let units: Vec<&[u8]> = AnnexBAccessUnits::new(data.as_slice()).collect();

        assert_eq!(
            units,
            vec![
                stream(&[SPS, PPS, IDR]).as_slice(),
                stream(&[P_FIRST, P_SECOND]).as_slice(),
                P_FIRST,
            ]
        );
    }

    #[test]
    fn splits_on_parameter_sets_and_delimiters() {
        let data = stream(&[AUD, SPS, PPS, IDR, AUD, P_FIRST, SPS, PPS, IDR]);
        let units: Vec<&[u8]> = AnnexBAccessUnits::new(data.as_slice()).collect();

        assert_eq!(
            units,
            vec![
                stream(&[AUD, SPS, PPS, IDR]).as_slice(),
                stream(&[AUD, P_FIRST]).as_slice(),
                stream(&[SPS, PPS, IDR]).as_slice(),
            ]
        );
    }

    #[test]
    fn skips_leading_garbage() {
        let data = stream(&[&[0xff, 0x12], IDR]);
        let units: Vec<&[u8]> = AnnexBAccessUnits::new(data.as_slice()).collect();

        assert_eq!(units, vec![IDR]);
    }

    #[test]
    fn no_start_code() {
        assert_eq!(AnnexBAccessUnits::new(&[1u8, 2, 3][..]).count(), 0);
        assert_eq!(AnnexBAccessUnits::new(&[0u8; 0][..]).count(), 0);
    }

    #[test]
    fn owned_source() {
        let mut source = AnnexBAccessUnits::new(stream(&[IDR, P_FIRST]));

        assert_eq!(source.next_unit().unwrap().as_deref(), Some(IDR));
        assert_eq!(source.next_unit().unwrap().as_deref(), Some(P_FIRST));
        assert!(source.next_unit().unwrap().is_none());
    }

    #[test]
    fn avc_configuration_record() {
        let record = [
            0x01, 0x42, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1e, 0x01, 0x00,
            0x04, 0x68, 0xce, 0x38, 0x80,
        ];
        let config = AvcConfig::parse(&record).unwrap();

        assert_eq!(config.nal_length_size, 4);
        assert_eq!(config.parameter_sets, stream(&[SPS, PPS]));

        assert!(AvcConfig::parse(&record[..10]).is_err());
        assert!(AvcConfig::parse(&[0x02, 0, 0, 0, 0xff, 0xe0]).is_err());
    }

    #[test]
    fn length_prefixed_to_annexb() {
        let sample = [0, 0, 0, 3, 0x65, 0x88, 0x84, 0, 0, 0, 2, 0x41, 0x9a];
        let mut out = Vec::new();

        avcc_to_annexb(&sample, 4, &mut out).unwrap();

        assert_eq!(
            out,
            [0, 0, 0, 1, 0x65, 0x88, 0x84, 0, 0, 0, 1, 0x41, 0x9a]
        );

        out.clear();
        assert!(avcc_to_annexb(&sample[..9], 4, &mut out).is_err());
    }
}
