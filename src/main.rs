fn main() {
    sonar_fusion::cli::run();
}
