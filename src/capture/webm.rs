//! Minimal WebM (Matroska) writer for a single video track.
//!
//! The file is assembled in memory: EBML header, then one Segment holding
//! Info, Tracks, the Clusters of SimpleBlocks and a Cues index.

use super::encoder::EncodedChunk;
use crate::error::CaptureError;

/// Matroska codec id of VP9.
pub const VP9_CODEC_ID: &str = "V_VP9";

/// Nanoseconds per timecode tick (1 ms).
const TIMECODE_SCALE: u64 = 1_000_000;

mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const CODEC_ID: u32 = 0x86;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

const TRACK_NUMBER: u64 = 1;
const TRACK_TYPE_VIDEO: u64 = 1;
const KEYFRAME_FLAG: u8 = 0x80;

fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

fn write_size(out: &mut Vec<u8>, size: u64) {
    let len = (1..=8u32)
        .find(|len| size < (1u64 << (7 * len)) - 1)
        .unwrap_or(8);
    let marked = size | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[(8 - len as usize)..]);
}

fn element(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    write_id(&mut out, id);
    write_size(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

fn uint_element(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    element(id, &bytes[skip..])
}

fn float_element(id: u32, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

fn string_element(id: u32, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

fn master(id: u32, children: &[Vec<u8>]) -> Vec<u8> {
    element(id, &children.concat())
}

struct Cluster {
    timecode_ms: u64,
    blocks: Vec<u8>,
    block_count: usize,
}

/// Collects encoded chunks and writes them as a WebM file.
pub struct WebmMuxer {
    width: u32,
    height: u32,
    codec_id: String,
    clusters: Vec<Cluster>,
    first_ms: Option<u64>,
    last_ms: u64,
    frame_ms: u64,
    finalized: bool,
}

impl WebmMuxer {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_codec(width, height, VP9_CODEC_ID)
    }

    pub fn with_codec(width: u32, height: u32, codec_id: &str) -> Self {
        Self {
            width,
            height,
            codec_id: codec_id.to_string(),
            clusters: Vec::new(),
            first_ms: None,
            last_ms: 0,
            frame_ms: 0,
            finalized: false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.clusters.iter().map(|c| c.block_count).sum()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Appends one chunk. Timestamps are rebased so the first chunk is at 0.
    pub fn add_chunk(&mut self, chunk: &EncodedChunk) -> Result<(), CaptureError> {
        if self.finalized {
            return Err(CaptureError::Mux("muxer already finalized".into()));
        }

        let absolute_ms = chunk.timestamp_us / 1000;
        let first_ms = *self.first_ms.get_or_insert(absolute_ms);
        let time_ms = absolute_ms.saturating_sub(first_ms).max(self.last_ms);

        let needs_cluster = match self.clusters.last() {
            None => true,
            Some(cluster) => {
                (chunk.keyframe && cluster.block_count > 0)
                    || time_ms - cluster.timecode_ms > i16::MAX as u64
            }
        };
        if needs_cluster {
            self.clusters.push(Cluster {
                timecode_ms: time_ms,
                blocks: Vec::new(),
                block_count: 0,
            });
        }

        if self.block_count() > 0 && time_ms > self.last_ms {
            self.frame_ms = time_ms - self.last_ms;
        }
        self.last_ms = time_ms;

        let Some(cluster) = self.clusters.last_mut() else {
            return Err(CaptureError::Mux("no open cluster".into()));
        };
        let relative = (time_ms - cluster.timecode_ms) as i16;

        let mut payload = Vec::with_capacity(chunk.data.len() + 4);
        payload.push(0x80 | TRACK_NUMBER as u8);
        payload.extend_from_slice(&relative.to_be_bytes());
        payload.push(if chunk.keyframe { KEYFRAME_FLAG } else { 0 });
        payload.extend_from_slice(&chunk.data);

        cluster.blocks.extend(element(id::SIMPLE_BLOCK, &payload));
        cluster.block_count += 1;
        Ok(())
    }

    /// Writes the complete file.
    pub fn finalize(&mut self) -> Result<Vec<u8>, CaptureError> {
        if self.finalized {
            return Err(CaptureError::Mux("muxer already finalized".into()));
        }
        self.finalized = true;

        let header = master(
            id::EBML,
            &[
                uint_element(id::EBML_VERSION, 1),
                uint_element(id::EBML_READ_VERSION, 1),
                uint_element(id::EBML_MAX_ID_LENGTH, 4),
                uint_element(id::EBML_MAX_SIZE_LENGTH, 8),
                string_element(id::DOC_TYPE, "webm"),
                uint_element(id::DOC_TYPE_VERSION, 4),
                uint_element(id::DOC_TYPE_READ_VERSION, 2),
            ],
        );

        let duration_ms = if self.block_count() == 0 {
            0
        } else {
            self.last_ms + self.frame_ms
        };
        let app = concat!("shaderpunk ", env!("CARGO_PKG_VERSION"));
        let info = master(
            id::INFO,
            &[
                uint_element(id::TIMECODE_SCALE, TIMECODE_SCALE),
                float_element(id::DURATION, duration_ms as f64),
                string_element(id::MUXING_APP, app),
                string_element(id::WRITING_APP, app),
            ],
        );

        let tracks = master(
            id::TRACKS,
            &[master(
                id::TRACK_ENTRY,
                &[
                    uint_element(id::TRACK_NUMBER, TRACK_NUMBER),
                    uint_element(id::TRACK_UID, TRACK_NUMBER),
                    uint_element(id::TRACK_TYPE, TRACK_TYPE_VIDEO),
                    uint_element(id::FLAG_LACING, 0),
                    string_element(id::CODEC_ID, &self.codec_id),
                    master(
                        id::VIDEO,
                        &[
                            uint_element(id::PIXEL_WIDTH, self.width as u64),
                            uint_element(id::PIXEL_HEIGHT, self.height as u64),
                        ],
                    ),
                ],
            )],
        );

        let mut body = Vec::new();
        body.extend(info);
        body.extend(tracks);

        let mut cue_points = Vec::new();
        for cluster in &self.clusters {
            // Cluster positions are relative to the start of the segment payload.
            let position = body.len() as u64;
            cue_points.push(master(
                id::CUE_POINT,
                &[
                    uint_element(id::CUE_TIME, cluster.timecode_ms),
                    master(
                        id::CUE_TRACK_POSITIONS,
                        &[
                            uint_element(id::CUE_TRACK, TRACK_NUMBER),
                            uint_element(id::CUE_CLUSTER_POSITION, position),
                        ],
                    ),
                ],
            ));

            let mut payload = uint_element(id::TIMECODE, cluster.timecode_ms);
            payload.extend_from_slice(&cluster.blocks);
            body.extend(element(id::CLUSTER, &payload));
        }
        if !cue_points.is_empty() {
            body.extend(master(id::CUES, &cue_points));
        }

        let mut out = header;
        out.extend(element(id::SEGMENT, &body));
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod parse {
    //! Just enough EBML reading to inspect muxer output in tests.

    pub struct Element<'a> {
        pub id: u32,
        pub data: &'a [u8],
    }

    fn vint(data: &[u8], keep_marker: bool) -> Option<(u64, usize)> {
        let first = *data.first()?;
        let len = first.leading_zeros() as usize + 1;
        if len > 8 || data.len() < len {
            return None;
        }
        let mut value = if keep_marker {
            first as u64
        } else {
            (first as u64) & ((1u64 << (8 - len)) - 1)
        };
        for b in &data[1..len] {
            value = (value << 8) | *b as u64;
        }
        Some((value, len))
    }

    pub fn children(mut data: &[u8]) -> Vec<Element<'_>> {
        let mut out = Vec::new();
        while let Some((id, id_len)) = vint(data, true) {
            let Some((size, size_len)) = vint(&data[id_len..], false) else {
                break;
            };
            let start = id_len + size_len;
            let end = start + size as usize;
            if end > data.len() {
                break;
            }
            out.push(Element {
                id: id as u32,
                data: &data[start..end],
            });
            data = &data[end..];
        }
        out
    }

    pub fn find<'a>(data: &'a [u8], path: &[u32]) -> Vec<&'a [u8]> {
        let Some((first, rest)) = path.split_first() else {
            return vec![data];
        };
        children(data)
            .into_iter()
            .filter(|e| e.id == *first)
            .flat_map(|e| find(e.data, rest))
            .collect()
    }

    pub fn uint(data: &[u8]) -> u64 {
        data.iter().fold(0, |acc, b| (acc << 8) | *b as u64)
    }
}
