//! Texture & resource manager: host-visible textures behind opaque ids.
//!
//! Ownership: the host owns a texture from `create` until `destroy`; engine-side users (session
//! parameter bindings) hold counted references through `retain`/`release`. GPU storage is freed
//! when neither remains. Binding marks an entry in flight until `end_frame`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use isf_core::{ResourceError, TextureFormat};

use crate::backend::{GpuBackend, TextureDesc};

/// Opaque texture id, rendered as `tex-<n>` at the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u64);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex-{}", self.0)
    }
}

impl FromStr for TextureId {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("tex-")
            .and_then(|n| n.parse::<u64>().ok())
            .map(TextureId)
            .ok_or_else(|| ResourceError::NotFound(s.to_string()))
    }
}

#[derive(Debug)]
struct TextureEntry<B: GpuBackend> {
    tex: B::Texture,
    fbo: Option<B::Framebuffer>,
    desc: TextureDesc,
    host_owned: bool,
    refs: usize,
    in_flight: usize,
}

#[derive(Debug)]
pub struct TextureManager<B: GpuBackend> {
    next_id: u64,
    entries: BTreeMap<TextureId, TextureEntry<B>>,
    max_size: u32,
}

impl<B: GpuBackend> TextureManager<B> {
    pub fn new(max_size: u32) -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            max_size: max_size.max(1),
        }
    }

    /// Live entries (host-owned or still referenced).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn desc(&self, id: TextureId) -> Option<TextureDesc> {
        self.entries.get(&id).map(|e| e.desc)
    }

    /// True while the host still owns `id` (created and not yet destroyed).
    pub fn is_host_owned(&self, id: TextureId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.host_owned)
    }

    fn check_size(&self, width: u32, height: u32, len: usize, format: TextureFormat) -> Result<(), ResourceError> {
        let invalid = |reason: String| ResourceError::InvalidSize {
            width,
            height,
            len,
            reason,
        };
        if width == 0 || height == 0 {
            return Err(invalid("dimensions must be non-zero".to_string()));
        }
        if width > self.max_size || height > self.max_size {
            return Err(invalid(format!("exceeds max texture size {}", self.max_size)));
        }
        let expected = TextureDesc::new(width, height, format).byte_len();
        if len != expected {
            return Err(invalid(format!("expected {expected} bytes for {format}")));
        }
        Ok(())
    }

    fn insert(&mut self, tex: B::Texture, desc: TextureDesc) -> TextureId {
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            TextureEntry {
                tex,
                fbo: None,
                desc,
                host_owned: true,
                refs: 0,
                in_flight: 0,
            },
        );
        id
    }

    /// Upload host pixels. Nothing is registered unless the upload succeeds.
    pub fn create(
        &mut self,
        gpu: &mut B,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureId, ResourceError> {
        self.check_size(width, height, bytes.len(), format)?;
        let desc = TextureDesc::new(width, height, format);
        let tex = gpu
            .create_texture(&desc, Some(bytes))
            .map_err(ResourceError::Backend)?;
        let id = self.insert(tex, desc);
        tracing::debug!(%id, width, height, %format, "created texture");
        Ok(id)
    }

    /// Drop host ownership. Errors with `NotFound` if the host already destroyed `id`.
    pub fn destroy(&mut self, gpu: &mut B, id: TextureId) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .filter(|e| e.host_owned)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        if entry.in_flight > 0 {
            return Err(ResourceError::InUse(id.to_string()));
        }
        entry.host_owned = false;
        self.free_if_unused(gpu, id);
        Ok(())
    }

    /// Take an engine-side reference.
    pub fn retain(&mut self, id: TextureId) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        entry.refs += 1;
        Ok(())
    }

    pub fn release(&mut self, gpu: &mut B, id: TextureId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        self.free_if_unused(gpu, id);
    }

    fn free_if_unused(&mut self, gpu: &mut B, id: TextureId) {
        let unused = self
            .entries
            .get(&id)
            .is_some_and(|e| !e.host_owned && e.refs == 0 && e.in_flight == 0);
        if !unused {
            return;
        }
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(fbo) = entry.fbo {
                gpu.delete_framebuffer(fbo);
            }
            gpu.delete_texture(entry.tex);
            tracing::debug!(%id, "freed texture");
        }
    }

    fn framebuffer(&mut self, gpu: &mut B, id: TextureId) -> Result<B::Framebuffer, ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        if let Some(fbo) = entry.fbo {
            return Ok(fbo);
        }
        let fbo = gpu
            .create_framebuffer(entry.tex)
            .map_err(ResourceError::Backend)?;
        entry.fbo = Some(fbo);
        Ok(fbo)
    }

    /// Explicit copy into a new host-owned texture.
    pub fn duplicate(&mut self, gpu: &mut B, id: TextureId) -> Result<TextureId, ResourceError> {
        let desc = self
            .desc(id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        let src = self.framebuffer(gpu, id)?;
        let tex = gpu
            .create_texture(&desc, None)
            .map_err(ResourceError::Backend)?;
        let dst = match gpu.create_framebuffer(tex) {
            Ok(fbo) => fbo,
            Err(e) => {
                gpu.delete_texture(tex);
                return Err(ResourceError::Backend(e));
            }
        };
        gpu.blit(src, dst, desc.width, desc.height);

        let copy = self.insert(tex, desc);
        if let Some(entry) = self.entries.get_mut(&copy) {
            entry.fbo = Some(dst);
        }
        tracing::debug!(%id, %copy, "duplicated texture");
        Ok(copy)
    }

    /// Read a texture back as RGBA8 rows, row 0 at the bottom. Float textures are quantized.
    pub fn read(&mut self, gpu: &mut B, id: TextureId) -> Result<Vec<u8>, ResourceError> {
        let desc = self
            .desc(id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        let fbo = self.framebuffer(gpu, id)?;
        gpu.read_pixels(fbo, desc.width, desc.height)
            .map_err(ResourceError::Backend)
    }

    /// Mark `id` in flight and return the texture to bind on `slot`.
    pub fn bind_for_read(&mut self, id: TextureId, slot: u32) -> Result<(u32, B::Texture), ResourceError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))?;
        entry.in_flight += 1;
        Ok((slot, entry.tex))
    }

    /// Mark `id` in flight and return a framebuffer rendering into it.
    pub fn bind_for_write(&mut self, gpu: &mut B, id: TextureId) -> Result<B::Framebuffer, ResourceError> {
        let fbo = self.framebuffer(gpu, id)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.in_flight += 1;
        }
        Ok(fbo)
    }

    /// Clear every in-flight mark. Called once per frame, on success and on failure.
    pub fn end_frame(&mut self, gpu: &mut B) {
        let mut orphans = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            entry.in_flight = 0;
            if !entry.host_owned && entry.refs == 0 {
                orphans.push(*id);
            }
        }
        for id in orphans {
            self.free_if_unused(gpu, id);
        }
    }

    /// Free everything, regardless of owners. Used on engine teardown.
    pub fn destroy_all(&mut self, gpu: &mut B) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            if let Some(fbo) = entry.fbo {
                gpu.delete_framebuffer(fbo);
            }
            gpu.delete_texture(entry.tex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    fn rgba(w: u32, h: u32) -> Vec<u8> {
        (0..w * h * 4).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn ids_render_and_parse() {
        let id: TextureId = "tex-42".parse().unwrap();
        assert_eq!(id.to_string(), "tex-42");
        assert!(matches!("42".parse::<TextureId>(), Err(ResourceError::NotFound(_))));
    }

    #[test]
    fn destroy_twice_is_not_found() {
        let mut gpu = HeadlessBackend::new();
        let mut tm = TextureManager::new(64);
        let id = tm.create(&mut gpu, &rgba(2, 2), 2, 2, TextureFormat::Rgba8).unwrap();

        tm.destroy(&mut gpu, id).unwrap();
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(
            tm.destroy(&mut gpu, id),
            Err(ResourceError::NotFound("tex-1".into()))
        );
    }

    #[test]
    fn invalid_sizes_register_nothing() {
        let mut gpu = HeadlessBackend::new();
        let mut tm = TextureManager::new(4);
        for (w, h, len) in [(0, 2, 0), (8, 1, 32), (2, 2, 15)] {
            let err = tm
                .create(&mut gpu, &vec![0; len], w, h, TextureFormat::Rgba8)
                .unwrap_err();
            assert!(matches!(err, ResourceError::InvalidSize { .. }), "{err}");
        }
        assert!(tm.is_empty());
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn in_flight_texture_cannot_be_destroyed() {
        let mut gpu = HeadlessBackend::new();
        let mut tm = TextureManager::new(64);
        let id = tm.create(&mut gpu, &rgba(1, 1), 1, 1, TextureFormat::Rgba8).unwrap();

        let (slot, _) = tm.bind_for_read(id, 3).unwrap();
        assert_eq!(slot, 3);
        assert_eq!(tm.destroy(&mut gpu, id), Err(ResourceError::InUse("tex-1".into())));

        tm.end_frame(&mut gpu);
        tm.destroy(&mut gpu, id).unwrap();
    }

    #[test]
    fn retained_texture_outlives_host_destroy() {
        let mut gpu = HeadlessBackend::new();
        let mut tm = TextureManager::new(64);
        let id = tm.create(&mut gpu, &rgba(1, 1), 1, 1, TextureFormat::Rgba8).unwrap();

        tm.retain(id).unwrap();
        tm.destroy(&mut gpu, id).unwrap();
        assert_eq!(tm.len(), 1);
        assert!(!tm.is_host_owned(id));
        assert!(matches!(tm.destroy(&mut gpu, id), Err(ResourceError::NotFound(_))));

        tm.release(&mut gpu, id);
        assert!(tm.is_empty());
        assert_eq!(gpu.live_textures(), 0);
    }

    #[test]
    fn duplicate_copies_pixels() {
        let mut gpu = HeadlessBackend::new();
        let mut tm = TextureManager::new(64);
        let bytes = rgba(3, 2);
        let id = tm.create(&mut gpu, &bytes, 3, 2, TextureFormat::Rgba8).unwrap();
        let copy = tm.duplicate(&mut gpu, id).unwrap();
        assert_ne!(id, copy);

        tm.destroy(&mut gpu, id).unwrap();
        assert_eq!(tm.read(&mut gpu, copy).unwrap(), bytes);
        assert!(matches!(tm.read(&mut gpu, id), Err(ResourceError::NotFound(_))));
    }
}
