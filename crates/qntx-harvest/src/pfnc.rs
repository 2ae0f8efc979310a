//! Pixel format lookup
//!
//! Values follow the PFNC 32-bit layout: bits 24-31 carry the mono/color
//! class, bits 16-23 the effective bits per pixel and bits 0-15 the id.
//! Bit 31 marks vendor-custom formats.

/// Native element of a pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    U8,
    U16,
    U32,
    F32,
}

impl ElementType {
    pub fn byte_width(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 | ElementType::F32 => 4,
        }
    }
}

/// Component arrangement family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Mono,
    Bayer,
    Rgb,
    Bgr,
    Rgba,
    Bgra,
    Yuv411,
    Yuv422,
    Coord3D,
    Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub name: &'static str,
    pub value: u32,
    pub layout: Layout,
    /// Components per pixel times two, so 4:1:1 (1.5) stays integral
    pub components_x2: u8,
    pub element: ElementType,
    /// Sub-byte packing; buffers are addressed as bytes
    pub packed: bool,
}

/// Effective bits per pixel encoded in a PFNC value.
pub fn bits_per_pixel(value: u32) -> u32 {
    (value >> 16) & 0xFF
}

pub fn is_custom(value: u32) -> bool {
    value & 0x8000_0000 != 0
}

impl PixelFormat {
    pub fn components_per_pixel(&self) -> f32 {
        f32::from(self.components_x2) / 2.0
    }

    pub fn bits_per_pixel(&self) -> u32 {
        bits_per_pixel(self.value)
    }

    pub fn is_single_component(&self) -> bool {
        self.components_x2 == 2
    }

    /// Element type a decoded view uses, given the row padding.
    pub fn view_element(&self, x_padding: usize) -> ElementType {
        if self.packed || x_padding > 0 {
            ElementType::U8
        } else {
            self.element
        }
    }

    /// Bytes a `width`×`height` image occupies, including padding.
    ///
    /// `y_padding` counts trailing elements of the view type, so it is
    /// scaled by the element width on the unpacked path. `None` on
    /// arithmetic overflow.
    pub fn required_bytes(
        &self,
        width: usize,
        height: usize,
        x_padding: usize,
        y_padding: usize,
    ) -> Option<usize> {
        let cx2 = usize::from(self.components_x2);
        let body = if self.packed {
            let bits = width
                .checked_mul(height)?
                .checked_mul(self.bits_per_pixel() as usize)?;
            bits.div_ceil(8).checked_add(height.checked_mul(x_padding)?)?
        } else if x_padding > 0 {
            let row_elements = width.checked_mul(cx2)?.div_ceil(2);
            let row_bytes = row_elements
                .checked_mul(self.element.byte_width())?
                .checked_add(x_padding)?;
            height.checked_mul(row_bytes)?
        } else {
            let elements = width.checked_mul(height)?.checked_mul(cx2)?.div_ceil(2);
            elements.checked_mul(self.element.byte_width())?
        };
        let trailing = y_padding.checked_mul(self.view_element(x_padding).byte_width())?;
        body.checked_add(trailing)
    }
}

/// Resolves pixel format values and names
pub trait FormatLookup: Send + Sync {
    fn by_value(&self, value: u32) -> Option<PixelFormat>;

    fn by_name(&self, name: &str) -> Option<PixelFormat>;
}

/// Built-in table of standard formats
#[derive(Debug, Default, Clone, Copy)]
pub struct PfncTable;

impl PfncTable {
    pub fn formats() -> &'static [PixelFormat] {
        FORMATS
    }
}

impl FormatLookup for PfncTable {
    fn by_value(&self, value: u32) -> Option<PixelFormat> {
        FORMATS.iter().find(|f| f.value == value).copied()
    }

    fn by_name(&self, name: &str) -> Option<PixelFormat> {
        FORMATS.iter().find(|f| f.name == name).copied()
    }
}

const fn pf(
    name: &'static str,
    value: u32,
    layout: Layout,
    components_x2: u8,
    element: ElementType,
    packed: bool,
) -> PixelFormat {
    PixelFormat {
        name,
        value,
        layout,
        components_x2,
        element,
        packed,
    }
}

use ElementType::{F32, U16, U8};
use Layout::*;

static FORMATS: &[PixelFormat] = &[
    // Mono
    pf("Mono1p", 0x0101_0037, Mono, 2, U8, true),
    pf("Mono2p", 0x0102_0038, Mono, 2, U8, true),
    pf("Mono4p", 0x0104_0039, Mono, 2, U8, true),
    pf("Mono8", 0x0108_0001, Mono, 2, U8, false),
    pf("Mono8s", 0x0108_0002, Mono, 2, U8, false),
    pf("Mono10", 0x0110_0003, Mono, 2, U16, false),
    pf("Mono10Packed", 0x010C_0004, Mono, 2, U8, true),
    pf("Mono10p", 0x010A_0046, Mono, 2, U8, true),
    pf("Mono12", 0x0110_0005, Mono, 2, U16, false),
    pf("Mono12Packed", 0x010C_0006, Mono, 2, U8, true),
    pf("Mono12p", 0x010C_0047, Mono, 2, U8, true),
    pf("Mono14", 0x0110_0025, Mono, 2, U16, false),
    pf("Mono16", 0x0110_0007, Mono, 2, U16, false),
    // Bayer
    pf("BayerGR8", 0x0108_0008, Bayer, 2, U8, false),
    pf("BayerRG8", 0x0108_0009, Bayer, 2, U8, false),
    pf("BayerGB8", 0x0108_000A, Bayer, 2, U8, false),
    pf("BayerBG8", 0x0108_000B, Bayer, 2, U8, false),
    pf("BayerGR10", 0x0110_000C, Bayer, 2, U16, false),
    pf("BayerRG10", 0x0110_000D, Bayer, 2, U16, false),
    pf("BayerGB10", 0x0110_000E, Bayer, 2, U16, false),
    pf("BayerBG10", 0x0110_000F, Bayer, 2, U16, false),
    pf("BayerGR12", 0x0110_0010, Bayer, 2, U16, false),
    pf("BayerRG12", 0x0110_0011, Bayer, 2, U16, false),
    pf("BayerGB12", 0x0110_0012, Bayer, 2, U16, false),
    pf("BayerBG12", 0x0110_0013, Bayer, 2, U16, false),
    pf("BayerGR10Packed", 0x010C_0026, Bayer, 2, U8, true),
    pf("BayerRG10Packed", 0x010C_0027, Bayer, 2, U8, true),
    pf("BayerGB10Packed", 0x010C_0028, Bayer, 2, U8, true),
    pf("BayerBG10Packed", 0x010C_0029, Bayer, 2, U8, true),
    pf("BayerGR12Packed", 0x010C_002A, Bayer, 2, U8, true),
    pf("BayerRG12Packed", 0x010C_002B, Bayer, 2, U8, true),
    pf("BayerGB12Packed", 0x010C_002C, Bayer, 2, U8, true),
    pf("BayerBG12Packed", 0x010C_002D, Bayer, 2, U8, true),
    pf("BayerGR16", 0x0110_002E, Bayer, 2, U16, false),
    pf("BayerRG16", 0x0110_002F, Bayer, 2, U16, false),
    pf("BayerGB16", 0x0110_0030, Bayer, 2, U16, false),
    pf("BayerBG16", 0x0110_0031, Bayer, 2, U16, false),
    pf("BayerBG10p", 0x010A_0052, Bayer, 2, U8, true),
    pf("BayerBG12p", 0x010C_0053, Bayer, 2, U8, true),
    pf("BayerGB10p", 0x010A_0054, Bayer, 2, U8, true),
    pf("BayerGB12p", 0x010C_0055, Bayer, 2, U8, true),
    pf("BayerGR10p", 0x010A_0056, Bayer, 2, U8, true),
    pf("BayerGR12p", 0x010C_0057, Bayer, 2, U8, true),
    pf("BayerRG10p", 0x010A_0058, Bayer, 2, U8, true),
    pf("BayerRG12p", 0x010C_0059, Bayer, 2, U8, true),
    // RGB / BGR
    pf("RGB8", 0x0218_0014, Rgb, 6, U8, false),
    pf("BGR8", 0x0218_0015, Bgr, 6, U8, false),
    pf("RGB10", 0x0230_0018, Rgb, 6, U16, false),
    pf("BGR10", 0x0230_0019, Bgr, 6, U16, false),
    pf("RGB12", 0x0230_001A, Rgb, 6, U16, false),
    pf("BGR12", 0x0230_001B, Bgr, 6, U16, false),
    pf("RGB14", 0x0230_005E, Rgb, 6, U16, false),
    pf("BGR14", 0x0230_004A, Bgr, 6, U16, false),
    pf("RGB16", 0x0230_0033, Rgb, 6, U16, false),
    pf("BGR16", 0x0230_004B, Bgr, 6, U16, false),
    // RGBa / BGRa
    pf("RGBa8", 0x0220_0016, Rgba, 8, U8, false),
    pf("BGRa8", 0x0220_0017, Bgra, 8, U8, false),
    pf("RGBa10", 0x0240_005F, Rgba, 8, U16, false),
    pf("BGRa10", 0x0240_004C, Bgra, 8, U16, false),
    pf("RGBa12", 0x0240_0061, Rgba, 8, U16, false),
    pf("BGRa12", 0x0240_004E, Bgra, 8, U16, false),
    pf("RGBa14", 0x0240_0063, Rgba, 8, U16, false),
    pf("BGRa14", 0x0240_0050, Bgra, 8, U16, false),
    pf("RGBa16", 0x0240_0064, Rgba, 8, U16, false),
    pf("BGRa16", 0x0240_0051, Bgra, 8, U16, false),
    // YUV
    pf("YUV411_8_UYYVYY", 0x020C_001E, Yuv411, 3, U8, false),
    pf("YUV422_8_UYVY", 0x0210_001F, Yuv422, 4, U8, false),
    pf("YUV422_8", 0x0210_0032, Yuv422, 4, U8, false),
    // 3D
    pf("Coord3D_C16", 0x0110_00B8, Coord3D, 2, U16, false),
    pf("Coord3D_ABC16", 0x0230_00B9, Coord3D, 6, U16, false),
    pf("Coord3D_A32f", 0x0120_00BD, Coord3D, 2, F32, false),
    pf("Coord3D_B32f", 0x0120_00BE, Coord3D, 2, F32, false),
    pf("Coord3D_C32f", 0x0120_00BF, Coord3D, 2, F32, false),
    pf("Coord3D_ABC32f", 0x0260_00C0, Coord3D, 6, F32, false),
    pf("Coord3D_AC32f", 0x0240_00C2, Coord3D, 4, F32, false),
    // Confidence
    pf("Confidence1", 0x0101_00C4, Confidence, 2, U8, true),
    pf("Confidence8", 0x0108_00C6, Confidence, 2, U8, false),
    pf("Confidence16", 0x0110_00C7, Confidence, 2, U16, false),
    pf("Confidence32f", 0x0120_00C8, Confidence, 2, F32, false),
];
