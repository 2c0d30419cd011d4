pub const DBUS_NAME_CONTROL: &str = "net.syncward.Control1";
pub const DBUS_INTERFACE_CONTROL: &str = "net.syncward.Control1";
pub const DBUS_OBJECT_PATH_CONTROL: &str = "/net/syncward/Control1";

pub const DBUS_ERROR_NOT_RUNNING: &str = "net.syncward.Control1.Error.NotRunning";
pub const DBUS_ERROR_NOT_FOUND: &str = "net.syncward.Control1.Error.NotFound";
pub const DBUS_ERROR_INVALID_ARGUMENT: &str = "net.syncward.Control1.Error.InvalidArgument";
pub const DBUS_ERROR_FAILED: &str = "net.syncward.Control1.Error.Failed";
pub const DBUS_ERROR_BUSY: &str = "net.syncward.Control1.Error.Busy";
