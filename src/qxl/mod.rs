//! QXL wire records
//!
//! Byte-exact mirrors of the QXL device structures the virtualization server
//! reads out of command memory. Ring records are `#[repr(C, packed)]` so
//! their layout matches the device ABI. The surface creation record is passed
//! to the worker by reference and keeps natural alignment with an explicit
//! tail pad. The size assertions in the tests pin both layouts.
//!
//! Only the subset needed for a primary surface, full-frame image blits and
//! solid fills is modelled. The drawable body union is kept as raw bytes and
//! accessed through typed helpers.

use bytemuck::{Pod, Zeroable};

/// Guest-physical address as seen by the server (plain address here)
pub type QxlPhysical = u64;

// Command types (QXLCommand.type)
pub const QXL_CMD_NOP: u32 = 0;
pub const QXL_CMD_DRAW: u32 = 1;
pub const QXL_CMD_UPDATE: u32 = 2;
pub const QXL_CMD_CURSOR: u32 = 3;
pub const QXL_CMD_MESSAGE: u32 = 4;
pub const QXL_CMD_SURFACE: u32 = 5;

// Drawable types
pub const QXL_DRAW_FILL: u8 = 1;
pub const QXL_DRAW_COPY: u8 = 3;

pub const QXL_EFFECT_OPAQUE: u8 = 1;

pub const SPICE_ROPD_OP_PUT: u16 = 1 << 3;

pub const SPICE_CLIP_TYPE_NONE: u32 = 0;

pub const SPICE_BRUSH_TYPE_NONE: u32 = 0;
pub const SPICE_BRUSH_TYPE_SOLID: u32 = 1;

pub const SPICE_IMAGE_TYPE_BITMAP: u8 = 0;
pub const SPICE_BITMAP_FMT_32BIT: u8 = 8;
pub const QXL_BITMAP_DIRECT: u8 = 1 << 0;
pub const QXL_BITMAP_TOP_DOWN: u8 = 1 << 2;

pub const QXL_IMAGE_GROUP_DEVICE: u32 = 1;

pub const SPICE_SURFACE_FMT_32_XRGB: u32 = 32;

/// The only memory slot group this device exposes
pub const MEMSLOT_GROUP: u32 = 0;
pub const NUM_MEMSLOTS: u32 = 1;
pub const NUM_MEMSLOTS_GROUPS: u32 = 1;
pub const MEMSLOT_ID_BITS: u8 = 1;
pub const MEMSLOT_GEN_BITS: u8 = 1;

/// Size of the drawable body union (largest member is QXLText)
pub const DRAWABLE_UNION_SIZE: usize = 68;

/// Pack an opaque 32-bit colour from 8-bit channels
pub const fn rgb(r: u8, g: u8, b: u8) -> u32 {
    argb(0xff, r, g, b)
}

pub const fn argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | (b as u32)
}

/// Pack an opaque colour from unit-range floats
pub fn rgb_f(r: f32, g: f32, b: f32) -> u32 {
    argb_f(1.0, r, g, b)
}

pub fn argb_f(a: f32, r: f32, g: f32, b: f32) -> u32 {
    let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;
    argb(channel(a), channel(r), channel(g), channel(b))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlRect {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

impl QxlRect {
    /// Rectangle covering `width x height` pixels starting at `(x, y)`,
    /// or `None` when an edge falls outside the `i32` coordinate space
    pub fn checked_from_origin(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        let right = x.checked_add(i32::try_from(width).ok()?)?;
        let bottom = y.checked_add(i32::try_from(height).ok()?)?;
        Some(Self {
            top: y,
            left: x,
            bottom,
            right,
        })
    }

    /// Like [`QxlRect::checked_from_origin`], clamping edges at `i32::MAX`
    pub fn from_origin(x: i32, y: i32, width: u32, height: u32) -> Self {
        let span = |len: u32| i32::try_from(len).unwrap_or(i32::MAX);
        Self {
            top: y,
            left: x,
            bottom: y.saturating_add(span(height)),
            right: x.saturating_add(span(width)),
        }
    }

    pub fn width(&self) -> i32 {
        let (left, right) = (self.left, self.right);
        right - left
    }

    pub fn height(&self) -> i32 {
        let (top, bottom) = (self.top, self.bottom);
        bottom - top
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlPoint {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlCommand {
    pub data: QxlPhysical,
    pub cmd_type: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlCommandExt {
    pub cmd: QxlCommand,
    pub group_id: u32,
    pub flags: u32,
}

impl QxlCommandExt {
    pub fn new(cmd_type: u32, data: QxlPhysical) -> Self {
        Self {
            cmd: QxlCommand {
                data,
                cmd_type,
                padding: 0,
            },
            group_id: MEMSLOT_GROUP,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlReleaseInfo {
    pub id: u64,
    pub next: u64,
}

/// Primary surface creation record handed to the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct QxlDevSurfaceCreate {
    pub width: u32,
    pub height: u32,
    pub stride: i32,
    pub format: u32,
    pub position: u32,
    pub mouse_mode: u32,
    pub flags: u32,
    pub surface_type: u32,
    pub mem: QxlPhysical,
    pub group_id: u32,
    /// Tail padding of the server's (unpacked) struct
    pub padding: u32,
}

impl QxlDevSurfaceCreate {
    /// xRGB surface with a bottom-up (negative) stride over `mem`
    pub fn primary(width: u32, height: u32, mem: QxlPhysical) -> Self {
        Self {
            width,
            height,
            stride: -(width as i32) * 4,
            format: SPICE_SURFACE_FMT_32_XRGB,
            position: 0,
            mouse_mode: 0,
            flags: 0,
            surface_type: 0,
            mem,
            group_id: MEMSLOT_GROUP,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlClip {
    pub clip_type: u32,
    pub data: QxlPhysical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlMask {
    pub flags: u8,
    pub pos: QxlPoint,
    pub bitmap: QxlPhysical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlBrush {
    pub brush_type: u32,
    /// `color` or `pattern`, depending on `brush_type`
    pub u: [u8; 16],
}

impl QxlBrush {
    pub fn solid(color: u32) -> Self {
        let mut u = [0u8; 16];
        u[..4].copy_from_slice(&color.to_ne_bytes());
        Self {
            brush_type: SPICE_BRUSH_TYPE_SOLID,
            u,
        }
    }

    pub fn color(&self) -> Option<u32> {
        let brush_type = self.brush_type;
        if brush_type != SPICE_BRUSH_TYPE_SOLID {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.u[..4]);
        Some(u32::from_ne_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlCopy {
    pub src_bitmap: QxlPhysical,
    pub src_area: QxlRect,
    pub rop_descriptor: u16,
    pub scale_mode: u8,
    pub mask: QxlMask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlFill {
    pub brush: QxlBrush,
    pub rop_descriptor: u16,
    pub mask: QxlMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlDrawable {
    pub release_info: QxlReleaseInfo,
    pub surface_id: u32,
    pub effect: u8,
    pub drawable_type: u8,
    pub self_bitmap: u8,
    pub self_bitmap_area: QxlRect,
    pub bbox: QxlRect,
    pub clip: QxlClip,
    pub mm_time: u32,
    pub surfaces_dest: [i32; 3],
    pub surfaces_rects: [QxlRect; 3],
    pub u: [u8; DRAWABLE_UNION_SIZE],
}

impl QxlDrawable {
    /// Opaque drawable on `surface_id` with no clip and no surface dependencies
    pub fn new(surface_id: u32, bbox: QxlRect, release_id: u64, mm_time: u32) -> Self {
        let mut drawable = Self::zeroed();
        drawable.release_info.id = release_id;
        drawable.surface_id = surface_id;
        drawable.effect = QXL_EFFECT_OPAQUE;
        drawable.bbox = bbox;
        drawable.clip = QxlClip {
            clip_type: SPICE_CLIP_TYPE_NONE,
            data: 0,
        };
        drawable.mm_time = mm_time;
        drawable.surfaces_dest = [-1, -1, -1];
        drawable
    }

    pub fn set_copy(&mut self, copy: &QxlCopy) {
        self.drawable_type = QXL_DRAW_COPY;
        self.write_body(bytemuck::bytes_of(copy));
    }

    pub fn set_fill(&mut self, fill: &QxlFill) {
        self.drawable_type = QXL_DRAW_FILL;
        self.write_body(bytemuck::bytes_of(fill));
    }

    pub fn copy(&self) -> Option<QxlCopy> {
        (self.drawable_type == QXL_DRAW_COPY).then(|| self.read_body())
    }

    pub fn fill(&self) -> Option<QxlFill> {
        (self.drawable_type == QXL_DRAW_FILL).then(|| self.read_body())
    }

    fn write_body(&mut self, bytes: &[u8]) {
        self.u = [0; DRAWABLE_UNION_SIZE];
        self.u[..bytes.len()].copy_from_slice(bytes);
    }

    fn read_body<T: Pod>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.u[..std::mem::size_of::<T>()])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlImageDescriptor {
    pub id: u64,
    pub image_type: u8,
    pub flags: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlBitmap {
    pub format: u8,
    pub flags: u8,
    pub x: u32,
    pub y: u32,
    pub stride: u32,
    pub palette: QxlPhysical,
    pub data: QxlPhysical,
}

/// Image record; the bitmap is the largest member of the image union
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct QxlImage {
    pub descriptor: QxlImageDescriptor,
    pub bitmap: QxlBitmap,
}

impl QxlImage {
    /// Stamp the descriptor id as the server expects: unique id high, group low
    pub fn set_image_id(&mut self, group: u32, unique: u32) {
        self.descriptor.id = ((unique as u64) << 32) | group as u64;
    }
}

/// Device parameters reported to the server during initialisation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevInitInfo {
    pub num_memslots_groups: u32,
    pub num_memslots: u32,
    pub memslot_gen_bits: u8,
    pub memslot_id_bits: u8,
    pub qxl_ram_size: u32,
    pub internal_groupslot_id: u8,
    pub n_surfaces: u32,
}

/// A memory slot registration; one identity-mapped slot covers all memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlot {
    pub slot_group_id: u32,
    pub slot_id: u32,
    pub generation: u32,
    pub virt_start: u64,
    pub virt_end: u64,
    pub addr_delta: u64,
    pub qxl_ram_size: u32,
}

impl MemSlot {
    pub fn identity() -> Self {
        Self {
            slot_group_id: MEMSLOT_GROUP,
            slot_id: 0,
            generation: 0,
            virt_start: 0,
            virt_end: !0,
            addr_delta: 0,
            qxl_ram_size: !0,
        }
    }
}

/// Release notification as delivered by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseInfoExt {
    pub id: u64,
    pub group_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_record_sizes_match_device_abi() {
        assert_eq!(size_of::<QxlRect>(), 16);
        assert_eq!(size_of::<QxlCommand>(), 16);
        assert_eq!(size_of::<QxlCommandExt>(), 24);
        assert_eq!(size_of::<QxlReleaseInfo>(), 16);
        assert_eq!(size_of::<QxlDevSurfaceCreate>(), 48);
        assert_eq!(std::mem::align_of::<QxlDevSurfaceCreate>(), 8);
        assert_eq!(size_of::<QxlClip>(), 12);
        assert_eq!(size_of::<QxlMask>(), 17);
        assert_eq!(size_of::<QxlBrush>(), 20);
        assert_eq!(size_of::<QxlCopy>(), 44);
        assert_eq!(size_of::<QxlFill>(), 39);
        assert_eq!(size_of::<QxlDrawable>(), 199);
        assert_eq!(size_of::<QxlImageDescriptor>(), 18);
        assert_eq!(size_of::<QxlBitmap>(), 30);
        assert_eq!(size_of::<QxlImage>(), 48);
    }

    #[test]
    fn test_surface_create_field_offsets() {
        let rec = QxlDevSurfaceCreate::primary(2, 2, 0);
        let base = &rec as *const QxlDevSurfaceCreate as usize;
        assert_eq!(&rec.surface_type as *const u32 as usize - base, 28);
        assert_eq!(&rec.mem as *const u64 as usize - base, 32);
        assert_eq!(&rec.group_id as *const u32 as usize - base, 40);
    }

    #[test]
    fn test_rect_edges_past_i32_are_refused() {
        assert_eq!(QxlRect::checked_from_origin(i32::MAX - 1, 0, 10, 10), None);
        assert_eq!(QxlRect::checked_from_origin(0, 0, u32::MAX, 1), None);
        assert_eq!(
            QxlRect::checked_from_origin(-4, 2, 8, 3),
            Some(QxlRect { top: 2, left: -4, bottom: 5, right: 4 })
        );

        let clamped = QxlRect::from_origin(i32::MAX - 1, 0, 10, 10);
        assert_eq!({ clamped.right }, i32::MAX);
        assert_eq!(clamped.width(), 1);
    }

    #[test]
    fn test_color_packing() {
        assert_eq!(rgb(0x12, 0x34, 0x56), 0xff12_3456);
        assert_eq!(argb(0x80, 0, 0, 0xff), 0x8000_00ff);
        assert_eq!(rgb_f(1.0, 0.0, 0.0), 0xffff_0000);
        assert_eq!(argb_f(0.0, 0.0, 1.0, 0.0), 0x0000_ff00);
    }

    #[test]
    fn test_primary_surface_record() {
        let rec = QxlDevSurfaceCreate::primary(1024, 480, 0x1000);
        assert_eq!({ rec.stride }, -4096);
        assert_eq!({ rec.format }, SPICE_SURFACE_FMT_32_XRGB);
        assert_eq!({ rec.mem }, 0x1000);
        assert_eq!({ rec.group_id }, MEMSLOT_GROUP);
    }

    #[test]
    fn test_drawable_body_accessors() {
        let bbox = QxlRect::from_origin(0, 0, 10, 10);
        let mut drawable = QxlDrawable::new(0, bbox, 9, 1000);
        assert!(drawable.copy().is_none());

        let fill = QxlFill {
            brush: QxlBrush::solid(rgb(1, 2, 3)),
            rop_descriptor: SPICE_ROPD_OP_PUT,
            mask: QxlMask::default(),
        };
        drawable.set_fill(&fill);
        assert_eq!(drawable.fill(), Some(fill));
        assert_eq!(drawable.fill().and_then(|f| f.brush.color()), Some(rgb(1, 2, 3)));
        assert!(drawable.copy().is_none());
        assert_eq!({ drawable.surfaces_dest }, [-1, -1, -1]);
    }

    #[test]
    fn test_image_id_packing() {
        let mut image = QxlImage::default();
        image.set_image_id(QXL_IMAGE_GROUP_DEVICE, 7);
        assert_eq!({ image.descriptor.id }, (7u64 << 32) | 1);
    }
}
