//! Maps catalog data (SKU, connector type) onto what the fixture should run.

use serde::Serialize;

use crate::error::ProductError;
use crate::protocol::Circuit;
use crate::report::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProductSeries {
    /// Coated, non-conductive connector shells.
    Studio,
    /// Bare metal shells bonded through the cable.
    Touring,
}

impl ProductSeries {
    /// Series from a SKU such as `TC-20GL`: `SC`/`SV` are studio, `TC`/`TV` touring.
    pub fn from_sku(sku: &str) -> Result<Self, ProductError> {
        let prefix = sku.split('-').next().unwrap_or("").trim().to_ascii_uppercase();
        match prefix.as_str() {
            "SC" | "SV" => Ok(ProductSeries::Studio),
            "TC" | "TV" => Ok(ProductSeries::Touring),
            _ => Err(ProductError::UnknownSeries(sku.to_string())),
        }
    }
}

/// Whether the shell-bond step means anything for this cable.
pub fn shell_bond_applicable(topology: Topology, series: ProductSeries) -> bool {
    topology == Circuit::Xlr && series == ProductSeries::Touring
}

pub fn topology_for_connector(connector_type: &str) -> Result<Topology, ProductError> {
    match connector_type.trim().to_ascii_uppercase().as_str() {
        "TS-TS" | "RA-TS" | "TS" => Ok(Circuit::Ts),
        "XLR" | "XLR-XLR" => Ok(Circuit::Xlr),
        _ => Err(ProductError::UnsupportedConnector(connector_type.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductProfile {
    pub sku: String,
    pub series: ProductSeries,
    pub topology: Topology,
}

impl ProductProfile {
    pub fn resolve(sku: &str, connector_type: &str) -> Result<Self, ProductError> {
        Ok(Self {
            sku: sku.to_string(),
            series: ProductSeries::from_sku(sku)?,
            topology: topology_for_connector(connector_type)?,
        })
    }

    pub fn shell_bond_applicable(&self) -> bool {
        shell_bond_applicable(self.topology, self.series)
    }
}
