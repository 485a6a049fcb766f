use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Payload published on `readings/{deviceId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerReading {
    pub device_id: i64,
    pub power_watts: f64,
    pub voltage: f64,
    pub current: f64,
    pub energy: f64,
    pub frequency: f64,
    pub power_factor: f64,
    pub timestamp: DateTime<Utc>,
}

impl PowerReading {
    pub fn topic(&self) -> String {
        format!("readings/{}", self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appliance {
    Fridge,
    Heater,
    Kettle,
    Lamp,
    Washer,
}

impl Appliance {
    pub const ALL: [Appliance; 5] = [
        Appliance::Fridge,
        Appliance::Heater,
        Appliance::Kettle,
        Appliance::Lamp,
        Appliance::Washer,
    ];

    /// (standby watts, running watts)
    fn draw(&self) -> (f64, f64) {
        match self {
            Appliance::Fridge => (2.0, 150.0),
            Appliance::Heater => (0.5, 1800.0),
            Appliance::Kettle => (0.0, 2200.0),
            Appliance::Lamp => (0.3, 60.0),
            Appliance::Washer => (1.5, 900.0),
        }
    }

    /// Chance per sample of flipping between standby and running.
    fn switch_probability(&self) -> f64 {
        match self {
            Appliance::Fridge => 0.2,
            Appliance::Kettle => 0.05,
            Appliance::Heater | Appliance::Lamp | Appliance::Washer => 0.1,
        }
    }

    fn power_factor(&self) -> f64 {
        match self {
            Appliance::Fridge | Appliance::Washer => 0.85,
            Appliance::Heater | Appliance::Kettle | Appliance::Lamp => 0.99,
        }
    }
}

/// One simulated meter with its running state and energy counter.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub id: i64,
    pub appliance: Appliance,
    running: bool,
    energy_kwh: f64,
    last_sample: Option<DateTime<Utc>>,
    spike_probability: f64,
}

impl SimulatedDevice {
    pub fn new(id: i64, appliance: Appliance, spike_probability: f64) -> Self {
        Self {
            id,
            appliance,
            running: false,
            energy_kwh: 0.0,
            last_sample: None,
            spike_probability: spike_probability.clamp(0.0, 1.0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn sample(&mut self, rng: &mut impl Rng, now: DateTime<Utc>) -> PowerReading {
        if rng.gen_bool(self.appliance.switch_probability()) {
            self.running = !self.running;
        }

        let (standby, running) = self.appliance.draw();
        let mut power_watts = if self.running {
            running * rng.gen_range(0.9..1.1)
        } else {
            standby
        };
        if self.running && rng.gen_bool(self.spike_probability) {
            power_watts *= rng.gen_range(1.5..2.5);
        }

        if let Some(last) = self.last_sample {
            let hours = (now - last).num_milliseconds().max(0) as f64 / 3_600_000.0;
            self.energy_kwh += power_watts * hours / 1000.0;
        }
        self.last_sample = Some(now);

        let voltage = rng.gen_range(225.0..235.0);
        let power_factor = self.appliance.power_factor();

        PowerReading {
            device_id: self.id,
            power_watts,
            voltage,
            current: power_watts / (voltage * power_factor),
            energy: self.energy_kwh,
            frequency: rng.gen_range(49.95..50.05),
            power_factor,
            timestamp: now,
        }
    }
}

/// Devices `first_id..first_id + count`, cycling through the appliance kinds.
pub fn fleet(first_id: i64, count: usize, spike_probability: f64) -> Vec<SimulatedDevice> {
    (0..count)
        .map(|i| {
            let appliance = Appliance::ALL[i % Appliance::ALL.len()];
            SimulatedDevice::new(first_id + i as i64, appliance, spike_probability)
        })
        .collect()
}
