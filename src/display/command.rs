//! Command records and their release contract
//!
//! A [`Command`] owns its wire payload from the moment it is built. The
//! payload lives in a `Box`, so the addresses written into the QXL records
//! stay valid while the command moves between the ring, the in-flight table
//! and the release path. The only way to give the payload up is
//! [`Command::release`], which consumes the command and fires its hook once.

use std::fmt;

use crate::qxl::{
    QxlCommandExt, QxlDevSurfaceCreate, QxlDrawable, QxlImage, QxlRect, QXL_CMD_DRAW,
};
use crate::renderer::damage::DamageRegion;
use crate::renderer::PixelView;

/// Identifier of a virtual display surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Identifier stamped into an image descriptor; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

/// Opaque handle written into a drawable's release-info field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReleaseId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateSurface,
    DrawCopy,
    DrawFill,
}

/// Why a payload left the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The server reported it no longer references the payload
    Server,
    /// Handed to the worker synchronously (primary surface creation)
    Delivered,
    /// Never reached the ring (enqueue failed)
    Rejected,
    /// Drained from the ring while its output was torn down
    Teardown,
    /// Force-released while the session shut down
    Shutdown,
}

/// What a release hook is told about the payload it covered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseNotice {
    pub id: ReleaseId,
    pub kind: CommandKind,
    pub surface_id: SurfaceId,
    pub reason: ReleaseReason,
}

/// Called exactly once, when the command is released
pub type ReleaseHook = Box<dyn FnOnce(&ReleaseNotice) + Send>;

/// A release id together with the hook that will fire for it
pub struct ReleaseTicket {
    pub(crate) id: ReleaseId,
    pub(crate) hook: ReleaseHook,
}

impl ReleaseTicket {
    pub fn id(&self) -> ReleaseId {
        self.id
    }
}

/// Blit payload: drawable + image records and the pixels they point at
pub(crate) struct ImageBlit {
    pub(crate) drawable: QxlDrawable,
    pub(crate) image: QxlImage,
    pub(crate) image_id: ImageId,
    pub(crate) damage: Vec<DamageRegion>,
    /// Keeps the caller's frame alive until release
    pub(crate) pixels: PixelView,
}

pub(crate) enum Payload {
    CreateSurface(Box<QxlDevSurfaceCreate>),
    DrawCopy(Box<ImageBlit>),
    DrawFill(Box<QxlDrawable>),
}

/// One unit of protocol work waiting for, or held by, the server
pub struct Command {
    kind: CommandKind,
    surface_id: SurfaceId,
    bbox: QxlRect,
    release_id: ReleaseId,
    payload: Payload,
    hook: ReleaseHook,
}

impl Command {
    pub(crate) fn new(surface_id: SurfaceId, bbox: QxlRect, payload: Payload, ticket: ReleaseTicket) -> Self {
        let kind = match payload {
            Payload::CreateSurface(_) => CommandKind::CreateSurface,
            Payload::DrawCopy(_) => CommandKind::DrawCopy,
            Payload::DrawFill(_) => CommandKind::DrawFill,
        };
        Self {
            kind,
            surface_id,
            bbox,
            release_id: ticket.id,
            payload,
            hook: ticket.hook,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn bbox(&self) -> QxlRect {
        self.bbox
    }

    pub fn release_id(&self) -> ReleaseId {
        self.release_id
    }

    pub fn drawable(&self) -> Option<&QxlDrawable> {
        match &self.payload {
            Payload::DrawCopy(blit) => Some(&blit.drawable),
            Payload::DrawFill(drawable) => Some(&**drawable),
            Payload::CreateSurface(_) => None,
        }
    }

    pub fn image(&self) -> Option<&QxlImage> {
        match &self.payload {
            Payload::DrawCopy(blit) => Some(&blit.image),
            _ => None,
        }
    }

    pub fn image_id(&self) -> Option<ImageId> {
        match &self.payload {
            Payload::DrawCopy(blit) => Some(blit.image_id),
            _ => None,
        }
    }

    /// Damage rectangles the blit was built for (diagnostic, not sent as clip)
    pub fn damage(&self) -> &[DamageRegion] {
        match &self.payload {
            Payload::DrawCopy(blit) => blit.damage.as_slice(),
            _ => &[],
        }
    }

    pub fn pixels(&self) -> Option<&PixelView> {
        match &self.payload {
            Payload::DrawCopy(blit) => Some(&blit.pixels),
            _ => None,
        }
    }

    pub fn surface_create(&self) -> Option<&QxlDevSurfaceCreate> {
        match &self.payload {
            Payload::CreateSurface(record) => Some(&**record),
            _ => None,
        }
    }

    /// The ring entry the server reads; `None` for surface creation, which
    /// goes to the worker instead
    pub fn ext(&self) -> Option<QxlCommandExt> {
        self.drawable()
            .map(|drawable| QxlCommandExt::new(QXL_CMD_DRAW, drawable as *const QxlDrawable as u64))
    }

    /// Give up the payload and fire the release hook
    pub fn release(self, reason: ReleaseReason) -> ReleaseNotice {
        let notice = ReleaseNotice {
            id: self.release_id,
            kind: self.kind,
            surface_id: self.surface_id,
            reason,
        };
        let Command { payload, hook, .. } = self;
        drop(payload);
        hook(&notice);
        notice
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("surface_id", &self.surface_id)
            .field("bbox", &self.bbox)
            .field("release_id", &self.release_id)
            .finish_non_exhaustive()
    }
}

/// What the server receives from `get_command`: the ring entry plus enough
/// metadata to account for it. The payload itself stays in the in-flight
/// table until the matching release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchedCommand {
    pub ext: QxlCommandExt,
    pub kind: CommandKind,
    pub surface_id: SurfaceId,
    pub bbox: QxlRect,
    pub release_id: ReleaseId,
}
