//! Backend used without the `logging` feature: nothing is printed, only the `log` crate's max
//! level is kept in sync so disabled messages stay cheap.

use crate::log::LogSettings;

impl LogSettings {
    pub(in crate::log) fn apply(&mut self) {
        log::set_max_level(self.level);
    }
}
