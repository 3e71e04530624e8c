fn main() {
    led_panel_audio::run()
}
