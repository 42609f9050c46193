//! 数据点当前值存储与变更检测。
//!
//! 每个数据点保存 `current` 与 `previous` 两个值：`previous` 始终等于上一次
//! 发出变更事件时的值，只有两者不同才会再次发出事件。

use domain::points::DATA_POINTS;
use domain::{DataChanged, DataPointDef, DataPointId, DataPointUpdate, DataPointValue};
use tracing::debug;

struct Slot {
    def: &'static DataPointDef,
    current: Option<DataPointValue>,
    previous: Option<DataPointValue>,
}

impl Slot {
    /// 当前值与上次发布值不同则生成变更事件
    fn take_change(&mut self) -> Option<DataChanged> {
        let current = self.current.as_ref()?;
        if self.previous.as_ref() == Some(current) {
            return None;
        }
        self.previous = Some(current.clone());
        Some(DataChanged {
            id: self.def.id,
            name: self.def.name,
            value: current.clone(),
        })
    }
}

/// 数据点值存储（按数据点表的声明顺序）。
pub struct ValueStore {
    slots: Vec<Slot>,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStore {
    pub fn new() -> Self {
        Self {
            slots: DATA_POINTS
                .iter()
                .map(|def| Slot {
                    def,
                    current: None,
                    previous: None,
                })
                .collect(),
        }
    }

    fn slot_mut(&mut self, id: DataPointId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|slot| slot.def.id == id)
    }

    /// 写入单个值；与上次发布值不同时返回变更事件。
    pub fn apply(&mut self, id: DataPointId, value: DataPointValue) -> Option<DataChanged> {
        let Some(slot) = self.slot_mut(id) else {
            debug!(target: "otgw.store", id = %id, "unknown data point skipped");
            return None;
        };
        slot.current = Some(value);
        slot.take_change()
    }

    /// 写入一帧的全部更新，再按声明顺序扫描变更。
    ///
    /// 派生点位与主数据点各自独立判断是否变化。
    pub fn apply_frame(&mut self, updates: &[DataPointUpdate]) -> Vec<DataChanged> {
        for update in updates {
            match self.slot_mut(update.id) {
                Some(slot) => slot.current = Some(update.value.clone()),
                None => {
                    debug!(target: "otgw.store", id = %update.id, "unknown data point skipped")
                }
            }
        }
        self.slots.iter_mut().filter_map(Slot::take_change).collect()
    }

    /// 当前值
    pub fn get(&self, id: DataPointId) -> Option<&DataPointValue> {
        self.slots
            .iter()
            .find(|slot| slot.def.id == id)
            .and_then(|slot| slot.current.as_ref())
    }

    /// 已有值的数据点快照（声明顺序）
    pub fn snapshot(&self) -> Vec<(&'static str, DataPointValue)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.current.clone().map(|value| (slot.def.name, value)))
            .collect()
    }
}
