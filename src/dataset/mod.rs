pub mod augment;
pub mod balance;
pub mod classes;
pub mod scan;

pub use augment::{warp, AffineParams, RandomAffine};
pub use balance::{
    augment_class, balance_class, balance_dataset, balance_in_place, reduce_class, BalanceOutcome,
    BalanceReport,
};
pub use classes::ClassIndex;
pub use scan::{
    count_images, count_images_per_class, find_common_images, is_image_file, list_images,
    print_class_counts, print_common_images, IMAGE_EXTENSIONS,
};
