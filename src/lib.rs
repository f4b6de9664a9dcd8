// LOADGEN -- TRACE-DRIVEN PROCESS LOAD REPLAY
// READS A TRACE OF (INTER-ARRIVAL TIME, ARGUMENT) PAIRS AND LAUNCHES ONE
// PAYLOAD PROCESS PER LINE AT ITS TRACE-DICTATED MOMENT, THEN RECORDS WHEN
// EACH PROCESS WAS REQUESTED AND WHEN IT RETURNED.
//
// PACER -> BOUNDED QUEUE -> LAUNCHER POOL -> ACTIVE-TASK TABLE <- REAPER
//                                                                  |
//                                              RESULT ASSEMBLY <---+

pub mod clock;
pub mod error;
pub mod launcher;
pub mod output;
pub mod pacer;
pub mod placement;
pub mod reaper;
pub mod replay;
pub mod results;
pub mod table;
pub mod trace;
