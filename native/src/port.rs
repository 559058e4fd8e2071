//! Live measurements for one PoE port.

/// Measured quantity on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Voltage,
    Current,
    Power,
}

/// Change notification delivered to a port observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PortEvent {
    Changed(Quantity, f64),
    MaxChanged(Quantity, f64),
}

/// Observer invoked synchronously after each mutation with the port id.
pub type PortObserver = Box<dyn FnMut(u32, PortEvent)>;

/// Minimum maxima a port must reach to pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub voltage: f64,
    pub power: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            voltage: 48.0,
            power: 4.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Reading {
    value: f64,
    max: f64,
}

pub struct PortModel {
    id: u32,
    voltage: Reading,
    current: Reading,
    power: Reading,
    observer: Option<PortObserver>,
}

impl PortModel {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            voltage: Reading::default(),
            current: Reading::default(),
            power: Reading::default(),
            observer: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Register the observer, replacing any previous one.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: FnMut(u32, PortEvent) + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    pub fn voltage(&self) -> f64 {
        self.voltage.value
    }

    pub fn max_voltage(&self) -> f64 {
        self.voltage.max
    }

    pub fn current(&self) -> f64 {
        self.current.value
    }

    pub fn max_current(&self) -> f64 {
        self.current.max
    }

    pub fn power(&self) -> f64 {
        self.power.value
    }

    pub fn max_power(&self) -> f64 {
        self.power.max
    }

    pub fn value(&self, quantity: Quantity) -> f64 {
        self.reading(quantity).value
    }

    pub fn max(&self, quantity: Quantity) -> f64 {
        self.reading(quantity).max
    }

    pub fn set_voltage(&mut self, volts: f64) {
        self.update(Quantity::Voltage, volts);
    }

    pub fn set_current(&mut self, amps: f64) {
        self.update(Quantity::Current, amps);
    }

    pub fn set_power(&mut self, watts: f64) {
        self.update(Quantity::Power, watts);
    }

    /// Both maxima have reached their thresholds. Maxima never decrease, so
    /// once this holds it keeps holding for the rest of the session.
    pub fn is_passing(&self, thresholds: &Thresholds) -> bool {
        self.voltage.max >= thresholds.voltage && self.power.max >= thresholds.power
    }

    fn reading(&self, quantity: Quantity) -> &Reading {
        match quantity {
            Quantity::Voltage => &self.voltage,
            Quantity::Current => &self.current,
            Quantity::Power => &self.power,
        }
    }

    fn reading_mut(&mut self, quantity: Quantity) -> &mut Reading {
        match quantity {
            Quantity::Voltage => &mut self.voltage,
            Quantity::Current => &mut self.current,
            Quantity::Power => &mut self.power,
        }
    }

    fn update(&mut self, quantity: Quantity, value: f64) {
        let reading = self.reading_mut(quantity);

        let changed = reading.value != value;
        if changed {
            reading.value = value;
        }

        let max_changed = reading.max < value;
        if max_changed {
            reading.max = value;
        }

        let id = self.id;
        if let Some(observer) = self.observer.as_mut() {
            if changed {
                observer(id, PortEvent::Changed(quantity, value));
            }
            if max_changed {
                observer(id, PortEvent::MaxChanged(quantity, value));
            }
        }
    }
}

impl std::fmt::Debug for PortModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortModel")
            .field("id", &self.id)
            .field("voltage", &self.voltage)
            .field("current", &self.current)
            .field("power", &self.power)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
