//! Ordered collection of ports under test.

use crate::port::{PortModel, Thresholds};
use std::collections::HashMap;

/// Formatted values for one port, as shown in the port list.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRow {
    pub label: String,
    pub voltage: String,
    pub max_voltage: String,
    pub current: String,
    pub max_current: String,
    pub power: String,
    pub max_power: String,
    pub passing: bool,
}

pub struct PortTable {
    ports: Vec<PortModel>,
    index: HashMap<u32, usize>,
    thresholds: Thresholds,
}

impl PortTable {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            ports: Vec::new(),
            index: HashMap::new(),
            thresholds,
        }
    }

    pub fn with_ports(ids: impl IntoIterator<Item = u32>, thresholds: Thresholds) -> Self {
        let mut table = Self::new(thresholds);
        for id in ids {
            table.add_port(PortModel::new(id));
        }
        table
    }

    /// Add a port. A port with the same id replaces the existing one in place.
    pub fn add_port(&mut self, port: PortModel) {
        match self.index.get(&port.id()) {
            Some(&row) => self.ports[row] = port,
            None => {
                self.index.insert(port.id(), self.ports.len());
                self.ports.push(port);
            }
        }
    }

    pub fn port(&self, id: u32) -> Option<&PortModel> {
        self.index.get(&id).map(|&row| &self.ports[row])
    }

    pub fn port_mut(&mut self, id: u32) -> Option<&mut PortModel> {
        self.index.get(&id).map(|&row| &mut self.ports[row])
    }

    pub(crate) fn port_at_mut(&mut self, row: usize) -> Option<&mut PortModel> {
        self.ports.get_mut(row)
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortModel> {
        self.ports.iter()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.ports.iter().map(PortModel::id).collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    pub fn is_port_passing(&self, id: u32) -> Option<bool> {
        self.port(id).map(|port| port.is_passing(&self.thresholds))
    }

    /// Every port passes. An empty table never passes.
    pub fn all_passing(&self) -> bool {
        !self.ports.is_empty() && self.ports.iter().all(|p| p.is_passing(&self.thresholds))
    }

    pub fn failing_ports(&self) -> Vec<u32> {
        self.ports
            .iter()
            .filter(|p| !p.is_passing(&self.thresholds))
            .map(PortModel::id)
            .collect()
    }

    pub fn rows(&self) -> Vec<PortRow> {
        self.ports
            .iter()
            .map(|p| PortRow {
                label: format!("LAN {}", p.id()),
                voltage: format!("{:.2}V", p.voltage()),
                max_voltage: format!("{:.2}V", p.max_voltage()),
                current: format!("{:.2}A", p.current()),
                max_current: format!("{:.2}A", p.max_current()),
                power: format!("{:.2}W", p.power()),
                max_power: format!("{:.2}W", p.max_power()),
                passing: p.is_passing(&self.thresholds),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_never_passes() {
        let table = PortTable::new(Thresholds::default());
        assert!(table.is_empty());
        assert!(!table.all_passing());
        assert!(table.failing_ports().is_empty());
    }

    #[test]
    fn all_passing_considers_every_port() {
        let mut table = PortTable::with_ports([1, 2], Thresholds::default());
        {
            let port = table.port_mut(1).unwrap();
            port.set_voltage(52.0);
            port.set_power(6.0);
        }
        assert_eq!(table.is_port_passing(1), Some(true));
        assert_eq!(table.is_port_passing(2), Some(false));
        assert!(!table.all_passing());
        assert_eq!(table.failing_ports(), vec![2]);

        {
            let port = table.port_mut(2).unwrap();
            port.set_voltage(48.0);
            port.set_power(4.5);
        }
        assert!(table.all_passing());
        assert_eq!(table.is_port_passing(9), None);
    }

    #[test]
    fn re_adding_a_port_keeps_order() {
        let mut table = PortTable::with_ports([4, 1, 6], Thresholds::default());
        table.port_mut(1).unwrap().set_voltage(30.0);
        table.add_port(PortModel::new(1));

        assert_eq!(table.ids(), vec![4, 1, 6]);
        assert_eq!(table.port(1).unwrap().max_voltage(), 0.0);
    }

    #[test]
    fn rows_are_formatted_for_display() {
        let mut table = PortTable::with_ports([3], Thresholds::default());
        {
            let port = table.port_mut(3).unwrap();
            port.set_voltage(50.123);
            port.set_current(0.1);
            port.set_power(5.0);
        }

        let rows = table.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "LAN 3");
        assert_eq!(rows[0].voltage, "50.12V");
        assert_eq!(rows[0].max_current, "0.10A");
        assert_eq!(rows[0].power, "5.00W");
        assert!(rows[0].passing);
    }
}
