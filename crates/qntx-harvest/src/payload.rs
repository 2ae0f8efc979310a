//! Payload classification and typed component views
//!
//! Decoding is explicit and side-effect free: the same bytes and metadata
//! always produce the same [`Payload`]. Components borrow from the buffer.

use std::sync::Arc;

use tracing::warn;
use zerocopy::FromBytes;

use crate::buffer::{BufferInfo, PartInfo};
use crate::error::HarvestError;
use crate::features::{self, names, NodeMap};
use crate::pfnc::{ElementType, FormatLookup, PfncTable, PixelFormat};

/// Payload type tag reported by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadType {
    #[default]
    Unknown,
    Image,
    RawData,
    File,
    ChunkData,
    Jpeg,
    Jpeg2000,
    H264,
    ChunkOnly,
    DeviceSpecific,
    MultiPart,
    Other(u32),
}

impl PayloadType {
    /// Map a GenTL `PAYLOAD_TYPE_*` value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => PayloadType::Unknown,
            1 => PayloadType::Image,
            2 => PayloadType::RawData,
            3 => PayloadType::File,
            4 => PayloadType::ChunkData,
            5 => PayloadType::Jpeg,
            6 => PayloadType::Jpeg2000,
            7 => PayloadType::H264,
            8 => PayloadType::ChunkOnly,
            9 => PayloadType::DeviceSpecific,
            10 => PayloadType::MultiPart,
            other => PayloadType::Other(other),
        }
    }
}

/// Decoded interpretation of a filled buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    Unknown,
    Image(Component2DImage<'a>),
    RawData(&'a [u8]),
    File(&'a [u8]),
    Jpeg(&'a [u8]),
    Jpeg2000(&'a [u8]),
    H264(&'a [u8]),
    ChunkOnly,
    MultiPart(Vec<Component2DImage<'a>>),
}

impl<'a> Payload<'a> {
    pub fn components(&self) -> &[Component2DImage<'a>] {
        match self {
            Payload::Image(component) => std::slice::from_ref(component),
            Payload::MultiPart(components) => components,
            _ => &[],
        }
    }
}

/// Element view over component bytes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentData<'a> {
    bytes: &'a [u8],
    element: ElementType,
}

impl<'a> ComponentData<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn element_count(&self) -> usize {
        self.bytes.len() / self.element.byte_width()
    }

    /// `None` when the element type differs or the bytes are misaligned.
    pub fn as_u16(&self) -> Option<&'a [u16]> {
        if self.element != ElementType::U16 {
            return None;
        }
        <[u16]>::ref_from_bytes(self.bytes).ok()
    }

    pub fn as_u32(&self) -> Option<&'a [u32]> {
        if self.element != ElementType::U32 {
            return None;
        }
        <[u32]>::ref_from_bytes(self.bytes).ok()
    }

    pub fn as_f32(&self) -> Option<&'a [f32]> {
        if self.element != ElementType::F32 {
            return None;
        }
        <[f32]>::ref_from_bytes(self.bytes).ok()
    }
}

/// One 2-D image inside a payload
#[derive(Debug, Clone, PartialEq)]
pub struct Component2DImage<'a> {
    pub width: usize,
    pub height: usize,
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_padding: usize,
    pub y_padding: usize,
    /// Raw PFNC value, 0 when none could be resolved
    pub pixel_format_value: u32,
    pub format: Option<PixelFormat>,
    data: Option<ComponentData<'a>>,
}

impl<'a> Component2DImage<'a> {
    /// `None` for unsupported formats or truncated buffers.
    pub fn data(&self) -> Option<&ComponentData<'a>> {
        self.data.as_ref()
    }

    pub fn is_decoded(&self) -> bool {
        self.data.is_some()
    }

    pub fn element_count(&self) -> usize {
        self.data.as_ref().map_or(0, ComponentData::element_count)
    }

    pub fn num_components_per_pixel(&self) -> f32 {
        self.format.map_or(0.0, |f| f.components_per_pixel())
    }

    /// Element layout as (rows, columns), row padding included.
    ///
    /// Trailing `y_padding` elements are excluded.
    pub fn shape(&self) -> Option<(usize, usize)> {
        let data = self.data.as_ref()?;
        let rows = self.height;
        if rows == 0 {
            return None;
        }
        let body = data.element_count().checked_sub(self.y_padding)?;
        Some((rows, body / rows))
    }
}

/// Decoder shared by every buffer of an engine
pub struct PayloadDecoder {
    formats: Arc<dyn FormatLookup>,
    node_map: Option<Arc<dyn NodeMap>>,
}

impl Default for PayloadDecoder {
    fn default() -> Self {
        Self::new(Arc::new(PfncTable), None)
    }
}

struct Geometry {
    width: usize,
    height: usize,
    x_offset: usize,
    y_offset: usize,
    x_padding: usize,
    y_padding: usize,
    pixel_format: Option<u32>,
}

impl PayloadDecoder {
    /// `node_map` supplies geometry the delivery metadata leaves out.
    pub fn new(formats: Arc<dyn FormatLookup>, node_map: Option<Arc<dyn NodeMap>>) -> Self {
        Self { formats, node_map }
    }

    pub fn decode<'a>(&self, info: &BufferInfo, bytes: &'a [u8]) -> Payload<'a> {
        match info.payload_type {
            PayloadType::Unknown => Payload::Unknown,
            PayloadType::Image | PayloadType::ChunkData => {
                Payload::Image(self.single_image(info, bytes))
            }
            PayloadType::RawData => Payload::RawData(bytes),
            PayloadType::File => Payload::File(bytes),
            PayloadType::Jpeg => Payload::Jpeg(bytes),
            PayloadType::Jpeg2000 => Payload::Jpeg2000(bytes),
            PayloadType::H264 => Payload::H264(bytes),
            PayloadType::ChunkOnly => Payload::ChunkOnly,
            PayloadType::MultiPart => Payload::MultiPart(
                info.parts
                    .iter()
                    .map(|part| self.part_image(part, bytes))
                    .collect(),
            ),
            PayloadType::DeviceSpecific | PayloadType::Other(_) => {
                // Try it as an image; only a resolvable format makes that believable
                let component = self.single_image(info, bytes);
                if component.format.is_some() {
                    Payload::Image(component)
                } else {
                    warn!(payload_type = ?info.payload_type, "unclassifiable payload");
                    Payload::Unknown
                }
            }
        }
    }

    /// Resolve a PFNC value, failing for formats the table lacks.
    pub fn resolve_format(&self, value: u32) -> Result<PixelFormat, HarvestError> {
        self.formats.by_value(value).ok_or_else(|| {
            HarvestError::DecodeUnsupported(format!("pixel format {:#010x}", value))
        })
    }

    fn single_image<'a>(&self, info: &BufferInfo, bytes: &'a [u8]) -> Component2DImage<'a> {
        let image = &info.image;
        let height = match image.height {
            Some(0) | None => image
                .delivered_image_height
                .filter(|h| *h > 0)
                .or_else(|| self.feature_size(names::HEIGHT)),
            some => some,
        };
        let geometry = Geometry {
            width: image
                .width
                .or_else(|| self.feature_size(names::WIDTH))
                .unwrap_or(0),
            height: height.unwrap_or(0),
            x_offset: image
                .x_offset
                .or_else(|| self.feature_size(names::OFFSET_X))
                .unwrap_or(0),
            y_offset: image
                .y_offset
                .or_else(|| self.feature_size(names::OFFSET_Y))
                .unwrap_or(0),
            x_padding: image.x_padding,
            y_padding: image.y_padding,
            pixel_format: image.pixel_format.or_else(|| self.feature_pixel_format()),
        };
        self.build(geometry, bytes, 0, None)
    }

    fn part_image<'a>(&self, part: &PartInfo, bytes: &'a [u8]) -> Component2DImage<'a> {
        let geometry = Geometry {
            width: part.width,
            height: part.height,
            x_offset: part.x_offset,
            y_offset: part.y_offset,
            x_padding: part.x_padding,
            y_padding: 0,
            pixel_format: Some(part.pixel_format),
        };
        self.build(geometry, bytes, part.data_offset, Some(part.data_size))
    }

    fn build<'a>(
        &self,
        g: Geometry,
        bytes: &'a [u8],
        offset: usize,
        declared_len: Option<usize>,
    ) -> Component2DImage<'a> {
        let mut component = Component2DImage {
            width: g.width,
            height: g.height,
            x_offset: g.x_offset,
            y_offset: g.y_offset,
            x_padding: g.x_padding,
            y_padding: g.y_padding,
            pixel_format_value: g.pixel_format.unwrap_or(0),
            format: None,
            data: None,
        };

        let Some(value) = g.pixel_format else {
            warn!("no pixel format available, component left undecoded");
            return component;
        };
        let format = match self.resolve_format(value) {
            Ok(format) => format,
            Err(e) => {
                warn!(error = %e, "component left undecoded");
                return component;
            }
        };
        component.format = Some(format);

        let len = match declared_len {
            Some(len) => Some(len),
            None => format.required_bytes(g.width, g.height, g.x_padding, g.y_padding),
        };
        let data = len
            .and_then(|len| offset.checked_add(len))
            .and_then(|end| bytes.get(offset..end));
        match data {
            Some(data) => {
                component.data = Some(ComponentData {
                    bytes: data,
                    element: format.view_element(g.x_padding),
                });
            }
            None => warn!(
                format = format.name,
                width = g.width,
                height = g.height,
                available = bytes.len(),
                "buffer too short for declared geometry"
            ),
        }
        component
    }

    fn feature_size(&self, name: &str) -> Option<usize> {
        self.node_map
            .as_deref()
            .and_then(|map| features::read_size(map, name))
    }

    fn feature_pixel_format(&self) -> Option<u32> {
        let map = self.node_map.as_deref()?;
        let name = features::read_enumeration(map, names::PIXEL_FORMAT)?;
        self.formats.by_name(&name).map(|f| f.value)
    }
}
