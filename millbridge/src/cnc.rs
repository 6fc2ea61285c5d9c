//! Mill state tracking.
//!
//! A [`CncState`] record mirrors what the controller reports: position,
//! feed, spindle, tool, laser, switch and sensor states, plus the
//! controller's notion of wall-clock time. The three parsers consume
//! the controller's status (`<...>`), diagnose (`{...}`) and modal
//! (`[...]`) report lines and mutate the record in place. Works
//! against both the mock controller and a real machine.

use std::time::Instant;

use log::debug;

/// Controller machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MachineState {
    /// Ready for commands.
    Idle,
    /// Executing a job.
    Run,
    /// Tool change in progress.
    Tool,
    /// Halted on an alarm.
    Alarm,
    /// Homing cycle.
    Home,
    /// Feed hold.
    Hold,
    /// Waiting on an external condition.
    Wait,
    /// Motors disabled.
    Disable,
    /// Sleep mode.
    Sleep,
    /// Job paused.
    Pause,
    /// No machine attached.
    #[default]
    NotConnected,
}

impl MachineState {
    /// Parse the wire representation used in status reports.
    pub fn from_report(s: &str) -> Option<Self> {
        Some(match s {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Tool" => Self::Tool,
            "Alarm" => Self::Alarm,
            "Home" => Self::Home,
            "Hold" => Self::Hold,
            "Wait" => Self::Wait,
            "Disable" => Self::Disable,
            "Sleep" => Self::Sleep,
            "Pause" => Self::Pause,
            "N/A" => Self::NotConnected,
            _ => return None,
        })
    }
}

/// A position in machine space, with optional rotary axes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
    /// A (rotary) axis.
    pub a: f64,
    /// B (rotary) axis.
    pub b: f64,
}

/// Feed rate information.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedInfo {
    /// Momentary feed rate.
    pub current: f64,
    /// Programmed feed rate.
    pub target: f64,
    /// Override percentage.
    pub override_pct: i32,
}

/// Spindle information.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpindleInfo {
    /// Momentary spindle speed.
    pub current_rpm: f64,
    /// Programmed spindle speed.
    pub target_rpm: f64,
    /// Override percentage.
    pub override_pct: i32,
    /// Vacuum mode flag.
    pub vacuum_mode: i32,
    /// Spindle temperature in °C.
    pub temperature: f64,
    /// Bed temperature in °C.
    pub bed_temperature: f64,
}

/// Tool information.
#[derive(Debug, Clone, Copy)]
pub struct ToolInfo {
    /// Currently loaded tool, -1 when empty.
    pub current_tool: i32,
    /// Tool length offset.
    pub length_offset: f64,
    /// Tool requested by the job, -1 when none.
    pub target_tool: i32,
}

impl Default for ToolInfo {
    fn default() -> Self {
        Self {
            current_tool: -1,
            length_offset: 0.0,
            target_tool: -1,
        }
    }
}

/// Laser head information.
#[derive(Debug, Clone, Copy)]
pub struct LaserInfo {
    /// Laser mode flag.
    pub mode: i32,
    /// Laser on/off state.
    pub state: i32,
    /// Test-fire flag.
    pub testing: i32,
    /// Power percentage.
    pub power: f64,
    /// Power scale percentage.
    pub scale: f64,
}

impl Default for LaserInfo {
    fn default() -> Self {
        Self {
            mode: 0,
            state: 0,
            testing: 0,
            power: 0.0,
            scale: 100.0,
        }
    }
}

/// Switch states reported by `diagnose`.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct SwitchStates {
    pub spindle: i32,
    pub spindle_fan: i32,
    pub vacuum: i32,
    pub light: i32,
    pub tool_sensor_pwr: i32,
    pub air: i32,
    pub wp_charge_pwr: i32,
    pub laser: i32,
}

/// Switch level values reported by `diagnose`.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct SwitchLevels {
    pub spindle: i32,
    pub spindle_fan: i32,
    pub vacuum: i32,
    pub laser: i32,
}

/// Sensor states reported by `diagnose`.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct SensorStates {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
    pub z_max: i32,
    pub cover: i32,
    pub probe: i32,
    pub calibrate: i32,
    pub atc_home: i32,
    pub tool_sensor: i32,
    pub e_stop: i32,
}

/// Maximum accepted epoch value (32-bit timestamp ceiling).
const MAX_EPOCH: f64 = 2_147_483_647.0;

/// The tracked state of a mill.
#[derive(Debug, Clone, Default)]
pub struct CncState {
    /// Machine state from the last status report.
    pub state: MachineState,
    /// Machine-space position.
    pub machine_position: Position,
    /// Work-space position.
    pub work_position: Position,
    /// Offset between machine and work coordinates.
    pub work_coordinate_offset: Position,
    /// Feed rates.
    pub feed: FeedInfo,
    /// Spindle state.
    pub spindle: SpindleInfo,
    /// Tool state.
    pub tool: ToolInfo,
    /// Laser state.
    pub laser: LaserInfo,
    /// Active work coordinate system (G54..G59).
    pub active_wcs: Option<String>,
    /// Table rotation angle in degrees.
    pub rotation_angle: f64,
    /// Active coordinate system index.
    pub active_coord_system: i32,
    /// Workpiece probe voltage.
    pub workpiece_voltage: f64,
    /// Maximum position delta seen by the controller.
    pub max_delta: f64,
    /// Reason for the last halt.
    pub halt_reason: i32,
    /// Automatic tool changer state.
    pub atc_state: i32,
    /// Lines played from the current job, -1 when idle.
    pub played_lines: i64,
    /// Percentage of the current job played.
    pub played_percent: i32,
    /// Seconds spent on the current job.
    pub played_seconds: i64,
    /// Switch on/off states.
    pub switches: SwitchStates,
    /// Switch level values.
    pub switch_levels: SwitchLevels,
    /// Sensor states.
    pub sensors: SensorStates,

    clock: Option<SimulatedClock>,
}

#[derive(Debug, Clone, Copy)]
struct SimulatedClock {
    initial_epoch: f64,
    set_at: Instant,
}

impl CncState {
    /// Create a fresh state record.
    pub fn new() -> Self {
        Self {
            played_lines: -1,
            ..Self::default()
        }
    }

    /// Parse a status report (`?` command).
    ///
    /// Format:
    /// `<Idle|MPos:-1.0,-1.0,-1.0,0.0,0.0|WPos:287.66,201.08,78.11,nan,0.0|F:0.0,3000.0,100.0|...>`
    ///
    /// Returns false when the envelope is malformed; individual
    /// malformed fields are skipped. `nan` coordinates read as 0.0,
    /// matching controller firmware behavior.
    pub fn parse_status_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        let Some(content) = line.strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
            return false;
        };

        let mut parts = content.split('|');
        if let Some(state_str) = parts.next() {
            if let Some(state) = MachineState::from_report(state_str) {
                self.state = state;
            }
        }

        for part in parts {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            self.apply_status_field(key, value);
        }
        true
    }

    #[allow(clippy::cast_possible_truncation)] // override percentages fit in i32
    fn apply_status_field(&mut self, key: &str, value: &str) {
        match key {
            "MPos" => {
                if let Some(c) = parse_coords(value) {
                    fill_position(&mut self.machine_position, &c);
                }
            }
            "WPos" => {
                if let Some(c) = parse_coords(value) {
                    fill_position(&mut self.work_position, &c);
                    self.recalculate_wco();
                }
            }
            "F" => {
                let fields: Vec<&str> = value.split(',').collect();
                self.feed.current = float_at(&fields, 0).unwrap_or(0.0);
                self.feed.target = float_at(&fields, 1).unwrap_or(0.0);
                self.feed.override_pct = float_at(&fields, 2).map_or(100, |f| f as i32);
            }
            "S" => {
                let fields: Vec<&str> = value.split(',').collect();
                self.spindle.current_rpm = float_at(&fields, 0).unwrap_or(0.0);
                self.spindle.target_rpm = float_at(&fields, 1).unwrap_or(0.0);
                self.spindle.override_pct = float_at(&fields, 2).map_or(100, |f| f as i32);
                self.spindle.vacuum_mode = int_at(&fields, 3).unwrap_or(0);
                self.spindle.temperature = float_at(&fields, 4).unwrap_or(0.0);
                self.spindle.bed_temperature = float_at(&fields, 5).unwrap_or(0.0);
            }
            "T" => {
                let fields: Vec<&str> = value.split(',').collect();
                self.tool.current_tool = int_at(&fields, 0).unwrap_or(-1);
                self.tool.length_offset = float_at(&fields, 1).unwrap_or(0.0);
                self.tool.target_tool = int_at(&fields, 2).unwrap_or(-1);
            }
            "W" => {
                if let Ok(v) = value.parse() {
                    self.workpiece_voltage = v;
                }
            }
            "L" => {
                let fields: Vec<&str> = value.split(',').collect();
                self.laser.mode = int_at(&fields, 0).unwrap_or(0);
                self.laser.state = int_at(&fields, 1).unwrap_or(0);
                self.laser.testing = int_at(&fields, 2).unwrap_or(0);
                self.laser.power = float_at(&fields, 3).unwrap_or(0.0);
                self.laser.scale = float_at(&fields, 4).unwrap_or(100.0);
            }
            "P" => {
                let fields: Vec<&str> = value.split(',').collect();
                self.played_lines = int_at(&fields, 0).map_or(-1, i64::from);
                self.played_percent = int_at(&fields, 1).unwrap_or(0);
                self.played_seconds = int_at(&fields, 2).map_or(0, i64::from);
            }
            "A" => {
                if let Ok(v) = value.parse() {
                    self.atc_state = v;
                }
            }
            "O" => {
                if let Ok(v) = value.parse() {
                    self.max_delta = v;
                }
            }
            "H" => {
                if let Ok(v) = value.parse() {
                    self.halt_reason = v;
                }
            }
            "R" => {
                if let Ok(v) = value.parse() {
                    self.rotation_angle = v;
                }
            }
            "G" => {
                if let Ok(v) = value.parse() {
                    self.active_coord_system = v;
                }
            }
            _ => debug!("unknown status field {key}"),
        }
    }

    fn recalculate_wco(&mut self) {
        let rad = self.rotation_angle.to_radians();
        let (sin, cos) = rad.sin_cos();
        let m = self.machine_position;
        let w = self.work_position;
        self.work_coordinate_offset.x = round3(m.x - (cos * w.x - sin * w.y));
        self.work_coordinate_offset.y = round3(m.y - (sin * w.x + cos * w.y));
        self.work_coordinate_offset.z = round3(m.z - w.z);
        self.work_coordinate_offset.a = round3(m.a - w.a);
    }

    /// Parse a diagnose report.
    ///
    /// Format: `{S:0,5000|L:0,0|F:1,0|V:0,1|G:0|T:0|E:0,0,0,0,0,0|P:0,0|A:1,0|I:0}`
    pub fn parse_diagnose_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        let Some(content) = line.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
            return false;
        };

        for part in content.split('|') {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            let Some(values) = parse_ints(value) else {
                continue;
            };
            let at = |i: usize| values.get(i).copied().unwrap_or(0);
            match key {
                "S" => {
                    self.switches.spindle = at(0);
                    self.switch_levels.spindle = at(1);
                }
                "L" => {
                    self.switches.laser = at(0);
                    self.switch_levels.laser = at(1);
                }
                "F" => {
                    self.switches.spindle_fan = at(0);
                    self.switch_levels.spindle_fan = at(1);
                }
                "V" => {
                    self.switches.vacuum = at(0);
                    self.switch_levels.vacuum = at(1);
                }
                "G" => self.switches.light = at(0),
                "T" => self.switches.tool_sensor_pwr = at(0),
                "R" => self.switches.air = at(0),
                "C" => self.switches.wp_charge_pwr = at(0),
                "E" => {
                    self.sensors.x_min = at(0);
                    self.sensors.x_max = at(1);
                    self.sensors.y_min = at(2);
                    self.sensors.y_max = at(3);
                    self.sensors.z_max = at(4);
                    self.sensors.cover = at(5);
                }
                "P" => {
                    self.sensors.probe = at(0);
                    self.sensors.calibrate = at(1);
                }
                "A" => {
                    self.sensors.atc_home = at(0);
                    self.sensors.tool_sensor = at(1);
                }
                "I" => self.sensors.e_stop = at(0),
                _ => debug!("unknown diagnose field {key}"),
            }
        }
        true
    }

    /// Parse a modal-state report (`$G` / `$I` command).
    ///
    /// Format: `[G0 G54 G17 G21 G90 G94 M0 M5 M9 T0 F3000.0000 S1.0000]`
    pub fn parse_modal_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        let Some(content) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
            return false;
        };

        for part in content.split_whitespace() {
            if let Some(rest) = part.strip_prefix('G') {
                if matches!(rest, "54" | "55" | "56" | "57" | "58" | "59") {
                    self.active_wcs = Some(part.to_string());
                }
            } else if let Some(rest) = part.strip_prefix('T') {
                if let Ok(tool) = rest.parse() {
                    self.tool.current_tool = tool;
                }
            } else if let Some(rest) = part.strip_prefix('F') {
                if let Ok(feed) = rest.parse() {
                    self.feed.target = feed;
                }
            } else if let Some(rest) = part.strip_prefix('S') {
                if let Ok(rpm) = rest.parse() {
                    self.spindle.target_rpm = rpm;
                }
            }
        }
        true
    }

    /// Initialize the simulated clock from a Unix epoch value.
    ///
    /// Accepts `0..=2^31-1`; anything else is rejected.
    pub fn set_time(&mut self, epoch: f64) -> bool {
        if !epoch.is_finite() || !(0.0..=MAX_EPOCH).contains(&epoch) {
            return false;
        }
        self.clock = Some(SimulatedClock {
            initial_epoch: epoch,
            set_at: Instant::now(),
        });
        true
    }

    /// Current simulated epoch, or `None` before `set_time`.
    pub fn current_time(&self) -> Option<f64> {
        self.clock
            .map(|c| c.initial_epoch + c.set_at.elapsed().as_secs_f64())
    }

    /// Whether the simulated clock has been initialized.
    pub fn time_initialized(&self) -> bool {
        self.clock.is_some()
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Parse a comma-separated coordinate list. A literal `nan` reads as
/// 0.0; any other unparseable token invalidates the whole list.
fn parse_coords(value: &str) -> Option<Vec<f64>> {
    value
        .split(',')
        .map(|s| {
            if s == "nan" {
                Some(0.0)
            } else {
                s.parse().ok()
            }
        })
        .collect()
}

fn parse_ints(value: &str) -> Option<Vec<i32>> {
    value.split(',').map(|s| s.trim().parse().ok()).collect()
}

fn fill_position(pos: &mut Position, coords: &[f64]) {
    pos.x = coords.first().copied().unwrap_or(0.0);
    pos.y = coords.get(1).copied().unwrap_or(0.0);
    pos.z = coords.get(2).copied().unwrap_or(0.0);
    pos.a = coords.get(3).copied().unwrap_or(0.0);
    pos.b = coords.get(4).copied().unwrap_or(0.0);
}

fn float_at(fields: &[&str], i: usize) -> Option<f64> {
    fields.get(i).and_then(|s| s.trim().parse().ok())
}

#[allow(clippy::cast_possible_truncation)]
fn int_at(fields: &[&str], i: usize) -> Option<i32> {
    // The controller emits integers as floats in some slots.
    float_at(fields, i).map(|f| f as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE_STATUS: &str = "<Idle|MPos:-1.0000,-1.0000,-1.0000,0.0000,0.0000|WPos:287.6600,201.0800,78.1109,nan,0.0000|F:0.0,3000.0,100.0|S:0.0,12000.0,100.0,0,23.2,24.2|T:2,-7.208,-1|W:0.00|L:0,0,0,0.0,100.0>";

    #[test]
    fn test_parse_status_basic() {
        let mut cnc = CncState::new();
        assert!(cnc.parse_status_line(IDLE_STATUS));

        assert_eq!(cnc.state, MachineState::Idle);
        assert!((cnc.machine_position.x - -1.0).abs() < 1e-9);
        assert!((cnc.work_position.x - 287.66).abs() < 1e-9);
        assert!((cnc.feed.target - 3000.0).abs() < 1e-9);
        assert_eq!(cnc.feed.override_pct, 100);
        assert!((cnc.spindle.target_rpm - 12000.0).abs() < 1e-9);
        assert!((cnc.spindle.temperature - 23.2).abs() < 1e-9);
        assert_eq!(cnc.tool.current_tool, 2);
        assert_eq!(cnc.tool.target_tool, -1);
    }

    #[test]
    fn test_parse_status_nan_reads_as_zero() {
        let mut cnc = CncState::new();
        assert!(cnc.parse_status_line(IDLE_STATUS));
        assert!((cnc.work_position.a - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_status_playback_and_extras() {
        let mut cnc = CncState::new();
        let line = "<Run|MPos:5.0,5.0,5.0,0.0,0.0|WPos:5.0,5.0,5.0,0.0,0.0|F:1000.0,1000.0,100.0|P:150,75,300|A:2|O:1.5|H:3|R:45.0|G:1>";
        assert!(cnc.parse_status_line(line));
        assert_eq!(cnc.state, MachineState::Run);
        assert_eq!(cnc.played_lines, 150);
        assert_eq!(cnc.played_percent, 75);
        assert_eq!(cnc.played_seconds, 300);
        assert_eq!(cnc.atc_state, 2);
        assert_eq!(cnc.halt_reason, 3);
        assert!((cnc.rotation_angle - 45.0).abs() < 1e-9);
        assert_eq!(cnc.active_coord_system, 1);
    }

    #[test]
    fn test_parse_status_rejects_bad_envelope() {
        let mut cnc = CncState::new();
        assert!(!cnc.parse_status_line("Idle|MPos:0.0,0.0,0.0"));
        assert!(!cnc.parse_status_line("<Idle|MPos:0.0"));
        assert!(!cnc.parse_status_line(""));
        assert!(cnc.parse_status_line("<>"));
    }

    #[test]
    fn test_parse_status_skips_malformed_fields() {
        let mut cnc = CncState::new();
        assert!(cnc.parse_status_line("<Idle|MPos:abc,def,ghi|W:1.5>"));
        // The bad MPos leaves the position untouched...
        assert!((cnc.machine_position.x - 0.0).abs() < f64::EPSILON);
        // ...while later fields still apply.
        assert!((cnc.workpiece_voltage - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_diagnose() {
        let mut cnc = CncState::new();
        let line = "{S:1,8000|L:0,0|F:1,75|V:1,50|G:1|T:1|R:0|C:1|E:0,1,0,1,1,0|P:1,0|A:1,1|I:0}";
        assert!(cnc.parse_diagnose_line(line));

        assert_eq!(cnc.switches.spindle, 1);
        assert_eq!(cnc.switch_levels.spindle, 8000);
        assert_eq!(cnc.switch_levels.spindle_fan, 75);
        assert_eq!(cnc.switches.vacuum, 1);
        assert_eq!(cnc.switches.light, 1);
        assert_eq!(cnc.sensors.x_max, 1);
        assert_eq!(cnc.sensors.z_max, 1);
        assert_eq!(cnc.sensors.probe, 1);
        assert_eq!(cnc.sensors.atc_home, 1);
        assert_eq!(cnc.sensors.e_stop, 0);
    }

    #[test]
    fn test_parse_modal() {
        let mut cnc = CncState::new();
        let line = "[G0 G54 G17 G21 G90 G94 M0 M5 M9 T1 F2000.0000 S10000.0000]";
        assert!(cnc.parse_modal_line(line));
        assert_eq!(cnc.active_wcs.as_deref(), Some("G54"));
        assert_eq!(cnc.tool.current_tool, 1);
        assert!((cnc.feed.target - 2000.0).abs() < 1e-9);
        assert!((cnc.spindle.target_rpm - 10000.0).abs() < 1e-9);
    }

    #[test]
    fn test_modal_only_wcs_codes_apply() {
        let mut cnc = CncState::new();
        assert!(cnc.parse_modal_line("[G0 G17 G21]"));
        assert_eq!(cnc.active_wcs, None);
        assert!(cnc.parse_modal_line("[G0 G55]"));
        assert_eq!(cnc.active_wcs.as_deref(), Some("G55"));
    }

    #[test]
    fn test_clock_lifecycle() {
        let mut cnc = CncState::new();
        assert!(!cnc.time_initialized());
        assert_eq!(cnc.current_time(), None);

        assert!(cnc.set_time(1_700_000_000.0));
        assert!(cnc.time_initialized());
        let now = cnc.current_time().unwrap();
        assert!(now >= 1_700_000_000.0);
        assert!(now < 1_700_000_010.0);
    }

    #[test]
    fn test_clock_rejects_out_of_range() {
        let mut cnc = CncState::new();
        assert!(!cnc.set_time(-1.0));
        assert!(!cnc.set_time(2_147_483_648.0));
        assert!(!cnc.set_time(f64::NAN));
        assert!(cnc.set_time(0.0));
        assert!(cnc.set_time(2_147_483_647.0));
    }
}
