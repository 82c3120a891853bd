mod work;

pub use work::Work;
