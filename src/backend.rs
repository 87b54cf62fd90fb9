// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Codec backends selected by identifier.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    codec::{Codec, CodecConfig},
    error::{Error, Result},
    fourcc::FourCC,
};

pub const V4L2_M2M: &str = "v4l2-m2m";

/// One way of creating codecs.
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether the backend can convert `input` into `output`.
    fn supports(&self, input: FourCC, output: FourCC) -> bool;

    fn create(&self, device: Option<&Path>, config: CodecConfig) -> Result<Codec>;
}

/// Stateful mem2mem codecs through a V4L2 device node.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    default_device: PathBuf,
}

impl V4l2Backend {
    pub fn new(default_device: impl Into<PathBuf>) -> Self {
        Self {
            default_device: default_device.into(),
        }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new("/dev/video0")
    }
}

impl Backend for V4l2Backend {
    fn id(&self) -> &str {
        V4L2_M2M
    }

    fn description(&self) -> &str {
        "V4L2 stateful mem2mem codec"
    }

    fn supports(&self, input: FourCC, output: FourCC) -> bool {
        input.is_compressed() != output.is_compressed()
    }

    fn create(&self, device: Option<&Path>, config: CodecConfig) -> Result<Codec> {
        let path = device.unwrap_or(&self.default_device);
        debug!("{} opening {:?}", V4L2_M2M, path);
        Codec::open(path, config)
    }
}

/// Backends keyed by identifier.
///
/// ```
/// use edgefirst_codec::{backend::{Registry, V4L2_M2M}, fourcc};
///
/// let registry = Registry::with_defaults();
/// let backend = registry.find(fourcc::H264, fourcc::NV12).unwrap();
/// assert_eq!(backend.id(), V4L2_M2M);
/// ```
#[derive(Default)]
pub struct Registry {
    backends: BTreeMap<String, Box<dyn Backend>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(V4l2Backend::default()));
        registry
    }

    /// Adds `backend`, returning the one it replaced.
    pub fn register(&mut self, backend: Box<dyn Backend>) -> Option<Box<dyn Backend>> {
        self.backends.insert(backend.id().to_string(), backend)
    }

    pub fn get(&self, id: &str) -> Option<&dyn Backend> {
        self.backends.get(id).map(|b| b.as_ref())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// First backend, in identifier order, supporting the conversion.
    pub fn find(&self, input: FourCC, output: FourCC) -> Option<&dyn Backend> {
        self.backends
            .values()
            .find(|b| b.supports(input, output))
            .map(|b| b.as_ref())
    }

    pub fn create(&self, id: &str, device: Option<&Path>, config: CodecConfig) -> Result<Codec> {
        let backend = self
            .get(id)
            .ok_or_else(|| Error::UnknownBackend(id.to_string()))?;
        if !backend.supports(config.input.fourcc, config.output.fourcc) {
            return Err(Error::UnsupportedFormat {
                requested: config.input.fourcc,
                actual: config.output.fourcc,
            });
        }
        backend.create(device, config)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc::{H264, NV12, RGBA};

    #[test]
    fn v4l2_backend_needs_one_compressed_side() {
        let backend = V4l2Backend::default();
        assert!(backend.supports(H264, NV12));
        assert!(backend.supports(NV12, H264));
        assert!(!backend.supports(NV12, RGBA));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = Registry::with_defaults();
        let config = CodecConfig::decoder(H264, NV12, 64, 64);
        let err = registry.create("omx", None, config).unwrap_err();
        assert_eq!(err.error_code(), 602);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![V4L2_M2M]);
    }
}
