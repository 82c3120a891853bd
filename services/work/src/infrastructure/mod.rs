mod procedures;

pub use procedures::WorkProcedures;
