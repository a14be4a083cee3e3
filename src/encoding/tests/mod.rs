mod tests_fixed;
