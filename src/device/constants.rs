use uuid::{uuid, Uuid};

/**
 * How often (milliseconds) to poll the adapters / the socket address while scanning.
 */
pub const POLL_DELAY: u64 = 250;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) releasing the transport may take before it is abandoned.
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;

/**
 * Capacity of every subscriber channel. A subscriber that falls this far behind misses updates.
 */
pub const SUBSCRIBER_BUFFER: usize = 16;

/**
 * Capacity of the request queue of a connection task.
 */
pub const REQUEST_BUFFER: usize = 32;

/**
 * The advertised local name of the controller.
 */
pub const DEVICE_NAME: &str = "ABurner";

/**
 * The WebSocket endpoint of the controller in access point mode.
 */
pub const SOCKET_URL: &str = "ws://192.168.4.1:81/";

/**
 * The UUID of the Bluetooth BLE service of the controller
 */
pub const AFTERBURNER_SERVICE: Uuid = uuid!("b5f9a000-2b6c-4f6a-93b1-2f1f5f9ab000");

pub const MODE_CHARACTERISTIC: Uuid = uuid!("b5f9a001-2b6c-4f6a-93b1-2f1f5f9ab001");
pub const START_COLOR_CHARACTERISTIC: Uuid = uuid!("b5f9a002-2b6c-4f6a-93b1-2f1f5f9ab002");
pub const END_COLOR_CHARACTERISTIC: Uuid = uuid!("b5f9a003-2b6c-4f6a-93b1-2f1f5f9ab003");
pub const SPEED_CHARACTERISTIC: Uuid = uuid!("b5f9a004-2b6c-4f6a-93b1-2f1f5f9ab004");
pub const BRIGHTNESS_CHARACTERISTIC: Uuid = uuid!("b5f9a005-2b6c-4f6a-93b1-2f1f5f9ab005");
pub const LED_COUNT_CHARACTERISTIC: Uuid = uuid!("b5f9a006-2b6c-4f6a-93b1-2f1f5f9ab006");
pub const THRESHOLD_CHARACTERISTIC: Uuid = uuid!("b5f9a007-2b6c-4f6a-93b1-2f1f5f9ab007");
pub const SAVE_CHARACTERISTIC: Uuid = uuid!("b5f9a008-2b6c-4f6a-93b1-2f1f5f9ab008");

/**
 * Notifies a UTF-8 JSON object `{"thr": float, "mode": int}`
 */
pub const STATUS_CHARACTERISTIC: Uuid = uuid!("b5f9a009-2b6c-4f6a-93b1-2f1f5f9ab009");

pub const CALIBRATION_START_CHARACTERISTIC: Uuid = uuid!("b5f9a010-2b6c-4f6a-93b1-2f1f5f9ab010");

/**
 * Notifies `[isCalibrated, minLow, minHigh, maxLow, maxHigh, (minVisits, maxVisits)?]`
 */
pub const CALIBRATION_STATUS_CHARACTERISTIC: Uuid = uuid!("b5f9a011-2b6c-4f6a-93b1-2f1f5f9ab011");
pub const CALIBRATION_RESET_CHARACTERISTIC: Uuid = uuid!("b5f9a012-2b6c-4f6a-93b1-2f1f5f9ab012");

/**
 * Optional; older firmware does not expose it.
 */
pub const HARDWARE_VERSION_CHARACTERISTIC: Uuid = uuid!("b5f9a013-2b6c-4f6a-93b1-2f1f5f9ab013");

/**
 * Written to the save / calibration characteristics to trigger the action.
 */
pub const COMMAND_TRIGGER: [u8; 1] = [1];

/**
 * Text frame used as a socket health check; the device answers with PONG.
 */
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/**
 * Calibration bounds (microseconds of throttle pulse) reported until the device says otherwise.
 */
pub const DEFAULT_THROTTLE_MIN: u16 = 900;
pub const DEFAULT_THROTTLE_MAX: u16 = 2000;

/**
 * The LED ring of the 4-channel hardware revision, which ignores the LED count setting.
 */
pub const NEW_HARDWARE_LED_COUNT: u16 = 36;
