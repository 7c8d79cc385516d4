// calotopo/src/lib.rs

// clustering passes
pub mod cluster {
    pub mod options;
    pub mod utility;
    pub mod classify;
    pub mod pairs;
    pub mod growing;
    pub mod summary;
    pub mod splitter;
    pub mod compact;
}

// orchestration
pub mod pipeline {
    pub mod stage;
    pub mod pool;
    pub mod processor;
}

// synthetic detector and events
pub mod sim {
    pub mod geometry;
    pub mod event;
}
