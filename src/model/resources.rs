//! Resource amounts and Kubernetes quantity conversion
//!
//! Internally CPU is held in millicores and memory in bytes, both as `i64`.
//! API-facing code converts to and from `Quantity` strings.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::Error;

/// The two resources the autoscaler manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// CPU, measured in millicores
    Cpu,
    /// Memory working set, measured in bytes
    Memory,
}

impl ResourceKind {
    /// Both managed resources, in canonical order
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Memory];

    /// The Kubernetes resource name (`cpu` / `memory`)
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A pair of optional resource amounts (millicores, bytes)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    /// CPU in millicores
    pub cpu_milli: Option<i64>,
    /// Memory in bytes
    pub memory_bytes: Option<i64>,
}

impl Resources {
    /// Build from explicit amounts
    pub fn new(cpu_milli: Option<i64>, memory_bytes: Option<i64>) -> Self {
        Self {
            cpu_milli,
            memory_bytes,
        }
    }

    /// Amount of the given resource, if set
    pub fn get(&self, kind: ResourceKind) -> Option<i64> {
        match kind {
            ResourceKind::Cpu => self.cpu_milli,
            ResourceKind::Memory => self.memory_bytes,
        }
    }

    /// Set the amount of the given resource
    pub fn set(&mut self, kind: ResourceKind, value: i64) {
        match kind {
            ResourceKind::Cpu => self.cpu_milli = Some(value),
            ResourceKind::Memory => self.memory_bytes = Some(value),
        }
    }

    /// True when neither resource is set
    pub fn is_empty(&self) -> bool {
        self.cpu_milli.is_none() && self.memory_bytes.is_none()
    }

    /// Iterate over the amounts that are set
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, i64)> + '_ {
        ResourceKind::ALL
            .into_iter()
            .filter_map(|k| self.get(k).map(|v| (k, v)))
    }

    /// Convert to a Kubernetes resource list
    pub fn to_quantity_map(&self) -> BTreeMap<String, Quantity> {
        self.iter()
            .map(|(k, v)| (k.name().to_string(), format_quantity(k, v)))
            .collect()
    }

    /// Parse from a Kubernetes resource list, ignoring unknown resource names
    pub fn from_quantity_map(map: &BTreeMap<String, Quantity>) -> Result<Self, Error> {
        let mut out = Self::default();
        for (name, quantity) in map {
            match name.as_str() {
                "cpu" => out.cpu_milli = Some(parse_quantity(ResourceKind::Cpu, quantity)?),
                "memory" => {
                    out.memory_bytes = Some(parse_quantity(ResourceKind::Memory, quantity)?)
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

/// CPU cores as a float, for histogram bucketing
pub fn cores_from_milli(milli: i64) -> f64 {
    milli as f64 / 1000.0
}

/// Millicores from a float core count, rounded up so tiny usage stays visible
pub fn milli_from_cores(cores: f64) -> i64 {
    (cores * 1000.0).ceil() as i64
}

/// Format an internal amount as a Kubernetes quantity string
pub fn format_quantity(kind: ResourceKind, value: i64) -> Quantity {
    match kind {
        ResourceKind::Cpu => Quantity(format!("{}m", value)),
        ResourceKind::Memory => Quantity(value.to_string()),
    }
}

/// Parse a Kubernetes quantity string into the internal amount
///
/// Handles the formats seen in real pod specs: plain integers, decimal
/// cores, the `m`/`n` cpu suffixes, and the binary/decimal memory suffixes.
pub fn parse_quantity(kind: ResourceKind, quantity: &Quantity) -> Result<i64, Error> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return Err(Error::validation("empty resource quantity"));
    }
    match kind {
        ResourceKind::Cpu => parse_cpu(s),
        ResourceKind::Memory => parse_memory(s),
    }
}

fn parse_cpu(s: &str) -> Result<i64, Error> {
    if let Some(n) = s.strip_suffix('n') {
        let nanos: i64 = n
            .parse()
            .map_err(|_| Error::validation(format!("invalid cpu quantity {s:?}")))?;
        return Ok(nanos / 1_000_000);
    }
    if let Some(m) = s.strip_suffix('m') {
        return m
            .parse()
            .map_err(|_| Error::validation(format!("invalid cpu quantity {s:?}")));
    }
    let cores: f64 = s
        .parse()
        .map_err(|_| Error::validation(format!("invalid cpu quantity {s:?}")))?;
    Ok((cores * 1000.0).round() as i64)
}

fn parse_memory(s: &str) -> Result<i64, Error> {
    const SUFFIXES: [(&str, i64); 10] = [
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("E", 1_000_000_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
    ];
    for (suffix, factor) in SUFFIXES {
        if let Some(num) = s.strip_suffix(suffix) {
            let value: f64 = num
                .parse()
                .map_err(|_| Error::validation(format!("invalid memory quantity {s:?}")))?;
            return Ok((value * factor as f64) as i64);
        }
    }
    if let Some(num) = s.strip_suffix('M') {
        let value: f64 = num
            .parse()
            .map_err(|_| Error::validation(format!("invalid memory quantity {s:?}")))?;
        return Ok((value * 1_000_000.0) as i64);
    }
    if let Some(num) = s.strip_suffix('k') {
        let value: f64 = num
            .parse()
            .map_err(|_| Error::validation(format!("invalid memory quantity {s:?}")))?;
        return Ok((value * 1_000.0) as i64);
    }
    let value: f64 = s
        .parse()
        .map_err(|_| Error::validation(format!("invalid memory quantity {s:?}")))?;
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MI: i64 = 1 << 20;

    #[test]
    fn parses_cpu_quantities() {
        let q = |s: &str| Quantity(s.to_string());
        assert_eq!(parse_quantity(ResourceKind::Cpu, &q("100m")).unwrap(), 100);
        assert_eq!(parse_quantity(ResourceKind::Cpu, &q("1")).unwrap(), 1000);
        assert_eq!(parse_quantity(ResourceKind::Cpu, &q("2.5")).unwrap(), 2500);
        assert_eq!(
            parse_quantity(ResourceKind::Cpu, &q("1500000n")).unwrap(),
            1
        );
        assert!(parse_quantity(ResourceKind::Cpu, &q("lots")).is_err());
    }

    #[test]
    fn parses_memory_quantities() {
        let q = |s: &str| Quantity(s.to_string());
        assert_eq!(
            parse_quantity(ResourceKind::Memory, &q("256Mi")).unwrap(),
            256 * MI
        );
        assert_eq!(
            parse_quantity(ResourceKind::Memory, &q("1Gi")).unwrap(),
            1 << 30
        );
        assert_eq!(
            parse_quantity(ResourceKind::Memory, &q("512M")).unwrap(),
            512_000_000
        );
        assert_eq!(
            parse_quantity(ResourceKind::Memory, &q("1048576")).unwrap(),
            MI
        );
    }

    #[test]
    fn core_conversion_rounds_up() {
        assert_eq!(milli_from_cores(0.25), 250);
        // Tiny usage stays visible instead of rounding to zero.
        assert_eq!(milli_from_cores(0.0001), 1);
        assert_eq!(milli_from_cores(cores_from_milli(300)), 300);
    }

    #[test]
    fn formats_round_trip() {
        assert_eq!(format_quantity(ResourceKind::Cpu, 300).0, "300m");
        assert_eq!(format_quantity(ResourceKind::Memory, 1048576).0, "1048576");

        let map = Resources::new(Some(250), Some(100 * MI)).to_quantity_map();
        let back = Resources::from_quantity_map(&map).unwrap();
        assert_eq!(back.cpu_milli, Some(250));
        assert_eq!(back.memory_bytes, Some(100 * MI));
    }

    #[test]
    fn iter_skips_unset_resources() {
        let r = Resources::new(Some(100), None);
        let collected: Vec<_> = r.iter().collect();
        assert_eq!(collected, vec![(ResourceKind::Cpu, 100)]);
        assert!(!r.is_empty());
        assert!(Resources::default().is_empty());
    }
}
