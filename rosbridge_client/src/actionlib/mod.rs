//! actionlib: preemptable long-running tasks layered on top of five
//! coordinated topics per action name (goal, cancel, status, feedback,
//! result).

pub mod client;
pub mod server;

/// The ROS `actionlib_msgs/GoalStatus` status lattice, numbered exactly as
/// the wire protocol encodes them so status frames can be matched without a
/// translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GoalState {
    Pending = 0,
    Active = 1,
    Preempted = 2,
    Succeeded = 3,
    Aborted = 4,
    Rejected = 5,
    Preempting = 6,
    Recalling = 7,
    Recalled = 8,
    Lost = 9,
}

impl GoalState {
    pub fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::Preempted,
            3 => Self::Succeeded,
            4 => Self::Aborted,
            5 => Self::Rejected,
            6 => Self::Preempting,
            7 => Self::Recalling,
            8 => Self::Recalled,
            9 => Self::Lost,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Whether this status is one of the terminal states in the lattice. A
    /// goal is only *reported* terminal once this is true AND a result has
    /// separately been observed — see [`client::Goal::is_terminal`].
    pub fn is_terminal_status(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Aborted | Self::Preempted | Self::Recalled | Self::Rejected | Self::Lost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_actionlib_msgs() {
        assert_eq!(GoalState::Pending.to_wire(), 0);
        assert_eq!(GoalState::Active.to_wire(), 1);
        assert_eq!(GoalState::Succeeded.to_wire(), 3);
        assert_eq!(GoalState::Lost.to_wire(), 9);
    }

    #[test]
    fn terminal_states_match_the_status_lattice() {
        for s in [GoalState::Succeeded, GoalState::Aborted, GoalState::Preempted, GoalState::Recalled, GoalState::Rejected, GoalState::Lost] {
            assert!(s.is_terminal_status());
        }
        for s in [GoalState::Pending, GoalState::Active, GoalState::Preempting, GoalState::Recalling] {
            assert!(!s.is_terminal_status());
        }
    }
}
