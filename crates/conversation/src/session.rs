use quill_llm::StreamTarget;

/// Lifecycle of one reply session for a thread.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Dispatching(StreamTarget),
    Streaming(StreamTarget),
    Committing(StreamTarget),
    Cancelled(StreamTarget),
    Failed {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Dispatch(StreamTarget),
    BeginStreaming(StreamTarget),
    Commit(StreamTarget),
    Cancel(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Settle(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveSession,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    OutOfOrder {
        from: &'static str,
        transition: &'static str,
    },
}

pub type SessionTransitionResult = Result<SessionState, SessionTransitionRejection>;

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dispatching(_) => "dispatching",
            Self::Streaming(_) => "streaming",
            Self::Committing(_) => "committing",
            Self::Cancelled(_) => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn target(&self) -> Option<StreamTarget> {
        match self {
            Self::Idle => None,
            Self::Dispatching(target)
            | Self::Streaming(target)
            | Self::Committing(target)
            | Self::Cancelled(target)
            | Self::Failed { target, .. } => Some(*target),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True while a cancel request can still prevent the commit.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Dispatching(_) | Self::Streaming(_))
    }

    /// Only the streaming session's own increments may touch the buffer.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition.
    ///
    /// Only `Idle` may dispatch; every other transition must name the session
    /// that is currently active. A cancel that arrives once the session is
    /// committing leaves the state unchanged.
    pub fn apply(&self, transition: SessionTransition) -> SessionTransitionResult {
        match transition {
            SessionTransition::Dispatch(target) => self.apply_dispatch(target),
            SessionTransition::BeginStreaming(target) => self.apply_begin_streaming(target),
            SessionTransition::Commit(target) => self.apply_commit(target),
            SessionTransition::Cancel(target) => self.apply_cancel(target),
            SessionTransition::Fail { target, message } => self.apply_fail(target, message),
            SessionTransition::Settle(target) => self.apply_settle(target),
        }
    }

    fn apply_dispatch(&self, target: StreamTarget) -> SessionTransitionResult {
        match self.target() {
            None => Ok(Self::Dispatching(target)),
            Some(active) => Err(SessionTransitionRejection::AlreadyActive {
                active,
                attempted: target,
            }),
        }
    }

    fn check_target(&self, target: StreamTarget) -> Result<(), SessionTransitionRejection> {
        match self.target() {
            None => Err(SessionTransitionRejection::NoActiveSession),
            Some(active) if active != target => Err(SessionTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            Some(_) => Ok(()),
        }
    }

    fn apply_begin_streaming(&self, target: StreamTarget) -> SessionTransitionResult {
        self.check_target(target)?;
        match self {
            Self::Dispatching(_) => Ok(Self::Streaming(target)),
            _ => self.out_of_order("begin-streaming"),
        }
    }

    fn apply_commit(&self, target: StreamTarget) -> SessionTransitionResult {
        self.check_target(target)?;
        match self {
            Self::Streaming(_) => Ok(Self::Committing(target)),
            _ => self.out_of_order("commit"),
        }
    }

    fn apply_settle(&self, target: StreamTarget) -> SessionTransitionResult {
        self.check_target(target)?;
        match self {
            Self::Committing(_) | Self::Cancelled(_) | Self::Failed { .. } => Ok(Self::Idle),
            _ => self.out_of_order("settle"),
        }
    }

    fn out_of_order(&self, transition: &'static str) -> SessionTransitionResult {
        Err(SessionTransitionRejection::OutOfOrder {
            from: self.name(),
            transition,
        })
    }

    fn apply_cancel(&self, target: StreamTarget) -> SessionTransitionResult {
        self.check_target(target)?;
        match self {
            Self::Dispatching(_) | Self::Streaming(_) => Ok(Self::Cancelled(target)),
            Self::Committing(_) | Self::Cancelled(_) => Ok(self.clone()),
            Self::Idle | Self::Failed { .. } => self.out_of_order("cancel"),
        }
    }

    fn apply_fail(&self, target: StreamTarget, message: String) -> SessionTransitionResult {
        self.check_target(target)?;
        match self {
            Self::Dispatching(_) | Self::Streaming(_) | Self::Committing(_) => {
                Ok(Self::Failed { target, message })
            }
            Self::Idle | Self::Cancelled(_) | Self::Failed { .. } => self.out_of_order("fail"),
        }
    }
}
