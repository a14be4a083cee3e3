mod tests_basic;
mod tests_split_merge;
