//! Gradient compressor plug-ins.
//!
//! The pipeline consumes compressors as opaque handles; strategies are
//! looked up by name from a process-wide registry so framework adapters
//! can select them from job configuration.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{EngineError, Result};

/// String-keyed options forwarded from job configuration.
pub type CompressorKwargs = HashMap<String, String>;

/// Polymorphic compressor handle.
pub trait Compressor: Send {
    /// Compress `buf`, returning the wire payload.
    fn compress(&mut self, buf: &[u8]) -> Vec<u8>;

    /// Invert `compress`.
    fn decompress(&mut self, buf: &[u8]) -> Vec<u8>;

    /// Fold the gradient into persistent momentum state before
    /// compression. Default: no momentum.
    fn update_momentum(&mut self, _grad: &mut [u8], _momentum: &mut [u8]) {}
}

impl std::fmt::Debug for dyn Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Compressor")
    }
}

type Factory = fn(&CompressorKwargs) -> Result<Box<dyn Compressor>>;

fn registry() -> &'static Mutex<HashMap<&'static str, Factory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, Factory> = HashMap::new();
        map.insert("identity", |_| Ok(Box::new(Identity)));
        map.insert("vanilla_momentum", make_vanilla_momentum);
        Mutex::new(map)
    })
}

/// Register an external strategy under `kind`.
pub fn register(kind: &'static str, factory: Factory) {
    registry().lock().unwrap().insert(kind, factory);
}

/// Construct the strategy registered under `kind`.
pub fn make(kind: &str, kwargs: &CompressorKwargs) -> Result<Box<dyn Compressor>> {
    let factory = {
        let map = registry().lock().unwrap();
        map.get(kind).copied()
    };
    match factory {
        Some(f) => f(kwargs),
        None => Err(EngineError::UnknownCompressor(kind.to_string())),
    }
}

/// Pass-through compressor; the base every wrapping strategy defaults to.
struct Identity;

impl Compressor for Identity {
    fn compress(&mut self, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }

    fn decompress(&mut self, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }
}

fn make_vanilla_momentum(kwargs: &CompressorKwargs) -> Result<Box<dyn Compressor>> {
    let mu = kwargs
        .get("momentum_mu")
        .ok_or_else(|| EngineError::CompressorOption("momentum_mu".into()))?
        .parse::<f32>()
        .map_err(|_| EngineError::CompressorOption("momentum_mu".into()))?;
    let inner_kind = kwargs
        .get("momentum_inner")
        .map(String::as_str)
        .unwrap_or("identity");
    let inner = make(inner_kind, kwargs)?;
    tracing::debug!(mu, inner = inner_kind, "compressor with momentum");
    Ok(Box::new(VanillaMomentum { inner, mu }))
}

/// `m_t = mu * m_{t-1} + g_t`, accumulated over f32 lanes.
struct VanillaMomentum {
    inner: Box<dyn Compressor>,
    mu: f32,
}

impl Compressor for VanillaMomentum {
    fn compress(&mut self, buf: &[u8]) -> Vec<u8> {
        self.inner.compress(buf)
    }

    fn decompress(&mut self, buf: &[u8]) -> Vec<u8> {
        self.inner.decompress(buf)
    }

    fn update_momentum(&mut self, grad: &mut [u8], momentum: &mut [u8]) {
        debug_assert_eq!(grad.len(), momentum.len());
        for (g, m) in grad
            .chunks_exact(4)
            .zip(momentum.chunks_exact_mut(4))
        {
            let gv = f32::from_le_bytes(g.try_into().unwrap());
            let mv = f32::from_le_bytes(m.try_into().unwrap());
            m.copy_from_slice(&(self.mu * mv + gv).to_le_bytes());
        }
    }
}
